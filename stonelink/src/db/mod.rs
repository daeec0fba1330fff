//! The persistent, content-addressed module database.
//!
//! A store is a chain-structured block file: a superblock at location 0
//! points at a chain of database entity blocks; each database points at a
//! table-list chain; each table lazily loads its column list, index list and
//! index trees on first access. All record writes append data blocks, so
//! prior versions of every object stay reachable through the header's
//! previous-block pointer.

pub mod block;
pub mod io;
pub mod record;
pub mod table;

use alloc::{
    collections::BTreeMap,
    string::{String, ToString},
    vec::Vec,
};
use block::{BlockReader, BlockType, BlockWriter, BLOCK_HEADER_LEN, NAME_LEN, SUPERBLOCK_MAGIC};
use io::BlockIo;
use log::{debug, error};
use table::Table;

pub use record::{ColumnType, Record, Value};

use crate::PAGE_SIZE;

/// Errors surfaced by the database. A damaged block makes the affected
/// record absent; it never takes the whole table down.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DbError {
    /// A read or write named an out-of-bounds or misaligned location.
    BadLocation(u64),
    /// A block carried an unknown type code.
    BadBlockType(u32),
    /// A block size was zero or not a whole number of pages.
    BadBlockSize(u64),
    /// A block body ended before its declared content.
    ShortBlock,
    /// The superblock magic did not match.
    BadMagic,
    /// An entity or column name exceeds the fixed name length.
    NameTooLong,
    /// No database with this id is known.
    NoSuchDatabase(u64),
    /// No table with this id is known.
    NoSuchTable(u64),
    /// A record named a column the table never declared.
    NoSuchColumn(String),
    /// A value or declaration disagreed with the column type.
    TypeMismatch(&'static str),
    /// The table reached its record cap.
    TableFull,
    /// The valuelog reached its byte cap.
    ValueTooLarge,
}

/// Handle to an open database within a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DatabaseId(pub u64);

/// Handle to a table, valid for the store that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableRef {
    /// Id of the owning database.
    pub database: u64,
    /// Id of the table within it.
    pub table: u64,
}

#[derive(Debug)]
struct Database {
    id: u64,
    name: String,
    deleted: bool,
    table_next_id: u64,
    table_list_location: u64,
    table_list_size: u64,
    /// Last persisted entity block of this database.
    metadata_location: u64,
    metadata_size: u64,
    tables: BTreeMap<u64, Table>,
    dirty: bool,
}

/// The top-level store.
#[derive(Debug)]
pub struct Db<I: BlockIo> {
    io: I,
    database_next_id: u64,
    database_chain_location: u64,
    database_chain_size: u64,
    databases: BTreeMap<u64, Database>,
    dirty: bool,
}

impl<I: BlockIo> Db<I> {
    /// Opens an existing store, or formats a fresh one when the backend has
    /// no valid superblock yet.
    pub fn open_or_create(mut io: I) -> Result<Self, DbError> {
        match Self::read_superblock(&mut io) {
            Ok((next_id, chain_location, chain_size)) => {
                let mut db = Self {
                    io,
                    database_next_id: next_id,
                    database_chain_location: chain_location,
                    database_chain_size: chain_size,
                    databases: BTreeMap::new(),
                    dirty: false,
                };
                db.load_databases()?;
                Ok(db)
            }
            Err(_) => {
                debug!("no superblock found, formatting a new store");
                let mut db = Self {
                    io,
                    database_next_id: 1,
                    database_chain_location: 0,
                    database_chain_size: 0,
                    databases: BTreeMap::new(),
                    dirty: true,
                };
                db.write_superblock()?;
                Ok(db)
            }
        }
    }

    fn read_superblock(io: &mut I) -> Result<(u64, u64, u64), DbError> {
        let bytes = io.read(0, PAGE_SIZE)?;
        let mut reader = BlockReader::new(&bytes, BlockType::Superblock)?;
        if reader.get_u64()? != SUPERBLOCK_MAGIC {
            return Err(DbError::BadMagic);
        }
        let page_size = u64::from(reader.get_u32()?);
        let _reserved = reader.get_u32()?;
        if page_size != PAGE_SIZE {
            return Err(DbError::BadBlockSize(page_size));
        }
        let next_id = reader.get_u64()?;
        let chain_location = reader.get_u64()?;
        let chain_size = reader.get_u64()?;
        Ok((next_id, chain_location, chain_size))
    }

    /// The superblock is the only block rewritten at a fixed location; it
    /// never chains backwards.
    fn write_superblock(&mut self) -> Result<(), DbError> {
        let mut writer = BlockWriter::new(BlockType::Superblock, 0, 0);
        writer.put_u64(SUPERBLOCK_MAGIC);
        writer.put_u32(PAGE_SIZE as u32);
        writer.put_u32(0);
        writer.put_u64(self.database_next_id);
        writer.put_u64(self.database_chain_location);
        writer.put_u64(self.database_chain_size);
        self.io.write(0, &writer.finish())?;
        self.dirty = false;
        Ok(())
    }

    /// Walks the database entity chain, keeping the newest revision per id.
    fn load_databases(&mut self) -> Result<(), DbError> {
        let mut location = self.database_chain_location;
        let mut size = self.database_chain_size;
        while location != 0 {
            let bytes = match self.io.read(location, size) {
                Ok(bytes) => bytes,
                Err(err) => {
                    error!("damaged database block at {location:#x}: {err:?}");
                    break;
                }
            };
            let mut reader = BlockReader::new(&bytes, BlockType::Database)?;
            let id = reader.get_u64()?;
            let name = reader.get_name()?;
            let deleted = reader.get_u8()? != 0;
            let table_next_id = reader.get_u64()?;
            let table_list_location = reader.get_u64()?;
            let table_list_size = reader.get_u64()?;

            // Older revisions of an already-seen database are skipped.
            if let alloc::collections::btree_map::Entry::Vacant(entry) = self.databases.entry(id) {
                let mut database = Database {
                    id,
                    name,
                    deleted,
                    table_next_id,
                    table_list_location,
                    table_list_size,
                    metadata_location: location,
                    metadata_size: size,
                    tables: BTreeMap::new(),
                    dirty: false,
                };
                Self::load_table_catalog(&mut self.io, &mut database)?;
                let _ = entry.insert(database);
            }

            if reader.header.prev_invalid {
                break;
            }
            location = reader.header.prev_location;
            size = reader.header.prev_size;
        }
        Ok(())
    }

    /// Walks a table-list chain and registers tables in the lazy-open state:
    /// only metadata location/size are known until first access.
    fn load_table_catalog(io: &mut I, database: &mut Database) -> Result<(), DbError> {
        let mut location = database.table_list_location;
        let mut size = database.table_list_size;
        while location != 0 {
            let bytes = match io.read(location, size) {
                Ok(bytes) => bytes,
                Err(err) => {
                    error!("damaged table list at {location:#x}: {err:?}");
                    break;
                }
            };
            let mut reader = BlockReader::new(&bytes, BlockType::TableList)?;
            let _database_id = reader.get_u64()?;
            let count = reader.get_u64()?;
            for _ in 0..count {
                let id = reader.get_u64()?;
                let name = reader.get_name()?;
                let deleted = reader.get_u8()? != 0;
                let metadata_location = reader.get_u64()?;
                let metadata_size = reader.get_u64()?;
                if !database.tables.contains_key(&id) {
                    debug!("table {name} of {} lazily registered", database.name);
                    let _ = database.tables.insert(
                        id,
                        Table::lazy(id, name, deleted, metadata_location, metadata_size),
                    );
                }
            }
            if reader.header.prev_invalid {
                break;
            }
            location = reader.header.prev_location;
            size = reader.header.prev_size;
        }
        Ok(())
    }

    /// Opens the named database, creating it on first use.
    pub fn database_create_or_open(&mut self, name: &str) -> Result<DatabaseId, DbError> {
        if name.len() > NAME_LEN {
            return Err(DbError::NameTooLong);
        }
        if let Some(db) = self.databases.values().find(|db| db.name == name && !db.deleted) {
            return Ok(DatabaseId(db.id));
        }
        let id = self.database_next_id;
        self.database_next_id += 1;
        let _ = self.databases.insert(
            id,
            Database {
                id,
                name: name.to_string(),
                deleted: false,
                table_next_id: 1,
                table_list_location: 0,
                table_list_size: 0,
                metadata_location: 0,
                metadata_size: 0,
                tables: BTreeMap::new(),
                dirty: true,
            },
        );
        self.dirty = true;
        debug!("database {name} created with id {id}");
        Ok(DatabaseId(id))
    }

    /// Opens the named table of `database`, creating it on first use. A
    /// lazily registered table is fully loaded here.
    pub fn table_create_or_open(
        &mut self,
        database: DatabaseId,
        name: &str,
        max_records: u64,
        max_valuelog_size: u64,
    ) -> Result<TableRef, DbError> {
        if name.len() > NAME_LEN {
            return Err(DbError::NameTooLong);
        }
        let db = self
            .databases
            .get_mut(&database.0)
            .ok_or(DbError::NoSuchDatabase(database.0))?;
        if let Some(table) = db.tables.values_mut().find(|t| t.name() == name && !t.is_deleted()) {
            table.set_limits(max_records, max_valuelog_size);
            table.ensure_open(&mut self.io)?;
            return Ok(TableRef {
                database: database.0,
                table: table.id(),
            });
        }
        let id = db.table_next_id;
        db.table_next_id += 1;
        db.dirty = true;
        let mut table = Table::new(id, name.to_string());
        table.set_limits(max_records, max_valuelog_size);
        let _ = db.tables.insert(id, table);
        self.dirty = true;
        debug!("table {name} created with id {id}");
        Ok(TableRef {
            database: database.0,
            table: id,
        })
    }

    /// Starts an empty record bound to `table`, to be filled through the
    /// typed column setters.
    #[must_use]
    pub fn create_record(&self, table: TableRef) -> Record {
        Record::new(table)
    }

    /// Declares a column of `table`. Upserts reject records naming a
    /// column that was never declared, or whose value type differs from
    /// the declaration.
    pub fn define_column(
        &mut self,
        handle: TableRef,
        name: &str,
        column_type: record::ColumnType,
    ) -> Result<(), DbError> {
        let (io, table) = self.table_mut(handle)?;
        table.ensure_open(io)?;
        table.define_column(name, column_type)?;
        self.dirty = true;
        Ok(())
    }

    fn table_mut(&mut self, handle: TableRef) -> Result<(&mut I, &mut Table), DbError> {
        let db = self
            .databases
            .get_mut(&handle.database)
            .ok_or(DbError::NoSuchDatabase(handle.database))?;
        let table = db
            .tables
            .get_mut(&handle.table)
            .ok_or(DbError::NoSuchTable(handle.table))?;
        Ok((&mut self.io, table))
    }

    /// Appends `record` as the newest version of its row.
    pub fn upsert_record(&mut self, record: &Record) -> Result<(), DbError> {
        let (io, table) = self.table_mut(record.table())?;
        table.ensure_open(io)?;
        table.upsert(io, record)?;
        self.dirty = true;
        Ok(())
    }

    /// Returns all live records whose columns match every column set in
    /// `probe`, newest first.
    pub fn search_record(&mut self, probe: &Record) -> Result<Vec<Record>, DbError> {
        let (io, table) = self.table_mut(probe.table())?;
        table.ensure_open(io)?;
        table.search(io, probe)
    }

    /// Returns the newest live record matching `probe`, if any.
    pub fn get_record(&mut self, probe: &Record) -> Result<Option<Record>, DbError> {
        Ok(self.search_record(probe)?.into_iter().next())
    }

    /// Logically deletes every record matching `probe` by appending deleted
    /// versions; prior versions stay chained.
    pub fn delete_record(&mut self, probe: &Record) -> Result<usize, DbError> {
        let matches = self.search_record(probe)?;
        let (io, table) = self.table_mut(probe.table())?;
        for record in &matches {
            table.delete(io, record)?;
        }
        if !matches.is_empty() {
            self.dirty = true;
        }
        Ok(matches.len())
    }

    /// Declares a secondary index over `column`; future searches probing the
    /// column use it. Existing rows are indexed by a chain scan.
    pub fn create_index(&mut self, handle: TableRef, column: &str) -> Result<(), DbError> {
        let (io, table) = self.table_mut(handle)?;
        table.ensure_open(io)?;
        table.create_index(io, column)
    }

    /// Persists every dirty object bottom-up: tables, table lists, database
    /// entities, then the superblock.
    pub fn persist(&mut self) -> Result<(), DbError> {
        for db in self.databases.values_mut() {
            let mut dirty_tables = Vec::new();
            for table in db.tables.values_mut() {
                if table.is_dirty() {
                    table.persist(&mut self.io)?;
                    dirty_tables.push(table.id());
                }
            }
            if !dirty_tables.is_empty() || db.dirty {
                // A fresh table-list block describing the current catalog.
                let mut writer = BlockWriter::new(
                    BlockType::TableList,
                    db.table_list_location,
                    db.table_list_size,
                );
                writer.put_u64(db.id);
                writer.put_u64(db.tables.len() as u64);
                for table in db.tables.values() {
                    writer.put_u64(table.id());
                    writer.put_name(table.name());
                    writer.put_u8(u8::from(table.is_deleted()));
                    let (location, size) = table.metadata();
                    writer.put_u64(location);
                    writer.put_u64(size);
                }
                let bytes = writer.finish();
                let location = self.io.end();
                self.io.write(location, &bytes)?;
                db.table_list_location = location;
                db.table_list_size = bytes.len() as u64;

                let mut writer = BlockWriter::new(
                    BlockType::Database,
                    self.database_chain_location,
                    self.database_chain_size,
                );
                writer.put_u64(db.id);
                writer.put_name(&db.name);
                writer.put_u8(u8::from(db.deleted));
                writer.put_u64(db.table_next_id);
                writer.put_u64(db.table_list_location);
                writer.put_u64(db.table_list_size);
                let bytes = writer.finish();
                let location = self.io.end();
                self.io.write(location, &bytes)?;
                db.metadata_location = location;
                db.metadata_size = bytes.len() as u64;
                self.database_chain_location = location;
                self.database_chain_size = bytes.len() as u64;
                db.dirty = false;
            }
        }
        self.write_superblock()?;
        self.io.flush()
    }

    /// Consumes the store and returns the backend (used by tests and by the
    /// manifest staging path).
    pub fn into_io(self) -> I {
        self.io
    }
}

const _: () = assert!(BLOCK_HEADER_LEN == 40);
