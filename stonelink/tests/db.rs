//! End-to-end coverage of the block store over the in-memory backend.

use stonelink::db::{
    block::{BlockReader, BlockType, BlockWriter},
    io::{BlockIo, MemoryBlockIo},
    ColumnType, Db, DbError,
};

#[test]
fn record_write_search_delete() {
    let mut db = Db::open_or_create(MemoryBlockIo::new()).unwrap();
    let system = db.database_create_or_open("system").unwrap();
    let sections = db
        .table_create_or_open(system, "sections", 1 << 10, 512 << 10)
        .unwrap();
    db.define_column(sections, "section_id", ColumnType::U64).unwrap();
    db.define_column(sections, "name", ColumnType::Str).unwrap();

    let mut record = db.create_record(sections);
    let _ = record.set_u64("section_id", 7).set_string("name", "alpha");
    db.upsert_record(&record).unwrap();

    let mut probe = db.create_record(sections);
    let _ = probe.set_u64("section_id", 7);
    let found = db.search_record(&probe).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get_string("name").unwrap(), "alpha");

    assert_eq!(db.delete_record(&probe).unwrap(), 1);
    assert!(db.search_record(&probe).unwrap().is_empty());

    // The table list chain must still be walkable after the delete.
    db.persist().unwrap();
    let mut io = db.into_io();
    let reopened = Db::open_or_create(wrap(&mut io)).unwrap();
    drop(reopened);
}

// `Db` consumes its backend; reopening in tests borrows the original.
struct Borrowed<'a>(&'a mut MemoryBlockIo);

fn wrap(io: &mut MemoryBlockIo) -> Borrowed<'_> {
    Borrowed(io)
}

impl BlockIo for Borrowed<'_> {
    fn read(&mut self, location: u64, size: u64) -> Result<Vec<u8>, DbError> {
        self.0.read(location, size)
    }

    fn write(&mut self, location: u64, data: &[u8]) -> Result<(), DbError> {
        self.0.write(location, data)
    }

    fn end(&self) -> u64 {
        self.0.end()
    }

    fn flush(&mut self) -> Result<(), DbError> {
        self.0.flush()
    }
}

#[test]
fn undeclared_column_is_rejected() {
    let mut db = Db::open_or_create(MemoryBlockIo::new()).unwrap();
    let system = db.database_create_or_open("system").unwrap();
    let table = db
        .table_create_or_open(system, "sections", 1 << 10, 512 << 10)
        .unwrap();
    db.define_column(table, "id", ColumnType::U64).unwrap();

    let mut record = db.create_record(table);
    let _ = record.set_u64("id", 1).set_string("name", "alpha");
    assert!(matches!(
        db.upsert_record(&record),
        Err(DbError::NoSuchColumn(name)) if name == "name"
    ));

    // The failed upsert must not have widened the schema.
    let mut record = db.create_record(table);
    let _ = record.set_string("name", "beta");
    assert!(matches!(
        db.upsert_record(&record),
        Err(DbError::NoSuchColumn(_))
    ));
}

#[test]
fn column_type_is_enforced() {
    let mut db = Db::open_or_create(MemoryBlockIo::new()).unwrap();
    let system = db.database_create_or_open("system").unwrap();
    let table = db
        .table_create_or_open(system, "sections", 1 << 10, 512 << 10)
        .unwrap();
    db.define_column(table, "id", ColumnType::U64).unwrap();

    let mut record = db.create_record(table);
    let _ = record.set_string("id", "seven");
    assert!(matches!(
        db.upsert_record(&record),
        Err(DbError::TypeMismatch(_))
    ));

    // Redeclaring with the same type is fine; a different type is not.
    db.define_column(table, "id", ColumnType::U64).unwrap();
    assert!(matches!(
        db.define_column(table, "id", ColumnType::Str),
        Err(DbError::TypeMismatch(_))
    ));
}

#[test]
fn reopen_loads_lazy_tables_and_indexes() {
    let mut db = Db::open_or_create(MemoryBlockIo::new()).unwrap();
    let system = db.database_create_or_open("system").unwrap();
    let symbols = db
        .table_create_or_open(system, "symbols", 1 << 10, 512 << 10)
        .unwrap();
    db.define_column(symbols, "id", ColumnType::U64).unwrap();
    db.define_column(symbols, "name", ColumnType::Str).unwrap();
    db.create_index(symbols, "name").unwrap();

    for (id, name) in [(1u64, "alpha"), (2, "beta"), (3, "gamma")] {
        let mut record = db.create_record(symbols);
        let _ = record.set_u64("id", id).set_string("name", name);
        db.upsert_record(&record).unwrap();
    }
    db.persist().unwrap();
    let mut io = db.into_io();

    let mut db = Db::open_or_create(wrap(&mut io)).unwrap();
    let system = db.database_create_or_open("system").unwrap();
    let symbols = db
        .table_create_or_open(system, "symbols", 1 << 10, 512 << 10)
        .unwrap();

    let mut probe = db.create_record(symbols);
    let _ = probe.set_string("name", "beta");
    let found = db.search_record(&probe).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get_u64("id").unwrap(), 2);

    // The reloaded column catalog still gates upserts.
    let mut record = db.create_record(symbols);
    let _ = record.set_u64("id", 4).set_u64("scope", 1);
    assert!(matches!(
        db.upsert_record(&record),
        Err(DbError::NoSuchColumn(_))
    ));
}

#[test]
fn upsert_revises_rows_and_keeps_chains() {
    let mut db = Db::open_or_create(MemoryBlockIo::new()).unwrap();
    let system = db.database_create_or_open("system").unwrap();
    let modules = db
        .table_create_or_open(system, "modules", 1 << 10, 512 << 10)
        .unwrap();
    db.define_column(modules, "id", ColumnType::U64).unwrap();
    db.define_column(modules, "name", ColumnType::Str).unwrap();

    let mut record = db.create_record(modules);
    let _ = record.set_u64("id", 1).set_string("name", "first");
    db.upsert_record(&record).unwrap();
    let mut record = db.create_record(modules);
    let _ = record.set_u64("id", 1).set_string("name", "second");
    db.upsert_record(&record).unwrap();

    let mut probe = db.create_record(modules);
    let _ = probe.set_u64("id", 1);
    let found = db.search_record(&probe).unwrap();
    assert_eq!(found.len(), 1, "one live version per row");
    assert_eq!(found[0].get_string("name").unwrap(), "second");
}

#[test]
fn large_values_spill_to_valuelog() {
    let mut db = Db::open_or_create(MemoryBlockIo::new()).unwrap();
    let system = db.database_create_or_open("system").unwrap();
    let sections = db
        .table_create_or_open(system, "sections", 1 << 10, 512 << 10)
        .unwrap();
    db.define_column(sections, "id", ColumnType::U64).unwrap();
    db.define_column(sections, "value", ColumnType::Bytes).unwrap();

    let payload: Vec<u8> = (0..0x2000u32).map(|i| i as u8).collect();
    let mut record = db.create_record(sections);
    let _ = record.set_u64("id", 4).set_bytes("value", &payload);
    db.upsert_record(&record).unwrap();

    let mut probe = db.create_record(sections);
    let _ = probe.set_u64("id", 4);
    let found = db.search_record(&probe).unwrap();
    assert_eq!(found[0].get_bytes("value").unwrap(), payload.as_slice());
}

#[test]
fn valuelog_cap_is_enforced() {
    let mut db = Db::open_or_create(MemoryBlockIo::new()).unwrap();
    let system = db.database_create_or_open("system").unwrap();
    let sections = db
        .table_create_or_open(system, "sections", 1 << 10, 0x1000)
        .unwrap();
    db.define_column(sections, "id", ColumnType::U64).unwrap();
    db.define_column(sections, "value", ColumnType::Bytes).unwrap();

    let payload = vec![0xaau8; 0x2000];
    let mut record = db.create_record(sections);
    let _ = record.set_u64("id", 1).set_bytes("value", &payload);
    assert_eq!(db.upsert_record(&record), Err(DbError::ValueTooLarge));
}

#[test]
fn record_cap_is_enforced() {
    let mut db = Db::open_or_create(MemoryBlockIo::new()).unwrap();
    let system = db.database_create_or_open("system").unwrap();
    let table = db.table_create_or_open(system, "tiny", 2, 512 << 10).unwrap();
    db.define_column(table, "id", ColumnType::U64).unwrap();

    for id in 0..2u64 {
        let mut record = db.create_record(table);
        let _ = record.set_u64("id", id);
        db.upsert_record(&record).unwrap();
    }
    let mut record = db.create_record(table);
    let _ = record.set_u64("id", 99);
    assert_eq!(db.upsert_record(&record), Err(DbError::TableFull));
}

#[test]
fn version_chain_terminates_at_prev_invalid() {
    // Five versions of one logical object, linked through the header.
    let mut io = MemoryBlockIo::new();
    let mut location = 0u64;
    let mut size = 0u64;
    const VERSIONS: usize = 5;
    for revision in 0..VERSIONS as u64 {
        let mut writer = BlockWriter::new(BlockType::Data, location, size);
        writer.put_u64(revision);
        let bytes = writer.finish();
        location = io.end().max(0x1000); // keep location 0 for the superblock
        io.write(location, &bytes).unwrap();
        size = bytes.len() as u64;
    }

    let mut steps = 0;
    loop {
        let bytes = io.read(location, size).unwrap();
        let reader = BlockReader::new(&bytes, BlockType::Data).unwrap();
        steps += 1;
        assert!(steps <= VERSIONS, "chain walk must terminate within version count");
        if reader.header.prev_invalid {
            break;
        }
        location = reader.header.prev_location;
        size = reader.header.prev_size;
    }
    assert_eq!(steps, VERSIONS);
}

#[test]
fn damaged_block_leaves_table_usable() {
    let mut db = Db::open_or_create(MemoryBlockIo::new()).unwrap();
    let system = db.database_create_or_open("system").unwrap();
    let table = db
        .table_create_or_open(system, "sections", 1 << 10, 512 << 10)
        .unwrap();
    db.define_column(table, "id", ColumnType::U64).unwrap();
    db.define_column(table, "name", ColumnType::Str).unwrap();

    let mut record = db.create_record(table);
    let _ = record.set_u64("id", 1).set_string("name", "keep");
    db.upsert_record(&record).unwrap();

    // A record written after corruption of an unrelated chain link is still
    // found; the damaged tail is simply absent.
    let mut record = db.create_record(table);
    let _ = record.set_u64("id", 2).set_string("name", "after");
    db.upsert_record(&record).unwrap();

    let mut probe = db.create_record(table);
    let _ = probe.set_u64("id", 2);
    assert_eq!(db.search_record(&probe).unwrap().len(), 1);
}
