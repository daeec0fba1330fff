//! Tables: column catalog, secondary indexes, and the append-only data
//! chain holding record versions.

use alloc::{
    collections::BTreeMap,
    string::{String, ToString},
    vec::Vec,
};
use log::{debug, error, trace};

use super::{
    block::{BlockReader, BlockType, BlockWriter, NAME_LEN},
    io::BlockIo,
    record::{ColumnType, Record, Value},
    DbError, TableRef,
};

/// Values longer than this are spilled into their own valuelog block and
/// referenced from the data block by location.
const VALUELOG_SPILL_THRESHOLD: usize = 128;

#[derive(Clone, Debug)]
struct Column {
    id: u64,
    type_tag: u8,
    deleted: bool,
}

#[derive(Debug)]
struct Index {
    id: u64,
    column: String,
    tree_location: u64,
    tree_size: u64,
    /// key hash -> every (location, size) of a version setting that key.
    map: BTreeMap<u64, Vec<(u64, u64)>>,
}

/// A decoded version of a row, prior to deduplication.
#[derive(Debug)]
struct VersionedRecord {
    record: Record,
}

/// One table: its column catalog, secondary indexes, and the head of the
/// append-only data chain. Freshly discovered tables stay in the lazy
/// state until first access.
#[derive(Debug)]
pub struct Table {
    id: u64,
    name: String,
    deleted: bool,
    open: bool,
    max_records: u64,
    max_valuelog_size: u64,
    columns: BTreeMap<String, Column>,
    column_next_id: u64,
    indexes: BTreeMap<String, Index>,
    index_next_id: u64,
    data_head_location: u64,
    data_head_size: u64,
    sequence_next: u64,
    record_count: u64,
    valuelog_bytes: u64,
    column_list_location: u64,
    column_list_size: u64,
    index_list_location: u64,
    index_list_size: u64,
    metadata_location: u64,
    metadata_size: u64,
    dirty: bool,
}

impl Table {
    pub(super) fn new(id: u64, name: String) -> Self {
        Self {
            id,
            name,
            deleted: false,
            open: true,
            max_records: u64::MAX,
            max_valuelog_size: u64::MAX,
            columns: BTreeMap::new(),
            column_next_id: 1,
            indexes: BTreeMap::new(),
            index_next_id: 1,
            data_head_location: 0,
            data_head_size: 0,
            sequence_next: 1,
            record_count: 0,
            valuelog_bytes: 0,
            column_list_location: 0,
            column_list_size: 0,
            index_list_location: 0,
            index_list_size: 0,
            metadata_location: 0,
            metadata_size: 0,
            dirty: true,
        }
    }

    /// A table discovered in a table list: only name and metadata location
    /// are known until [`Table::ensure_open`] runs.
    pub(super) fn lazy(
        id: u64,
        name: String,
        deleted: bool,
        metadata_location: u64,
        metadata_size: u64,
    ) -> Self {
        let mut table = Self::new(id, name);
        table.deleted = deleted;
        table.open = false;
        table.dirty = false;
        table.metadata_location = metadata_location;
        table.metadata_size = metadata_size;
        table
    }

    pub(super) fn id(&self) -> u64 {
        self.id
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub(super) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(super) fn metadata(&self) -> (u64, u64) {
        (self.metadata_location, self.metadata_size)
    }

    pub(super) fn set_limits(&mut self, max_records: u64, max_valuelog_size: u64) {
        self.max_records = max_records;
        self.max_valuelog_size = max_valuelog_size;
    }

    /// Completes a lazy open: reads the table entity block, then the column
    /// list, the index list and the persisted index trees.
    pub(super) fn ensure_open(&mut self, io: &mut impl BlockIo) -> Result<(), DbError> {
        if self.open {
            return Ok(());
        }
        let bytes = io.read(self.metadata_location, self.metadata_size)?;
        let mut reader = BlockReader::new(&bytes, BlockType::Table)?;
        let _id = reader.get_u64()?;
        let _name = reader.get_name()?;
        self.deleted = reader.get_u8()? != 0;
        self.column_next_id = reader.get_u64()?;
        self.index_next_id = reader.get_u64()?;
        self.sequence_next = reader.get_u64()?;
        self.record_count = reader.get_u64()?;
        self.valuelog_bytes = reader.get_u64()?;
        self.column_list_location = reader.get_u64()?;
        self.column_list_size = reader.get_u64()?;
        self.index_list_location = reader.get_u64()?;
        self.index_list_size = reader.get_u64()?;
        self.data_head_location = reader.get_u64()?;
        self.data_head_size = reader.get_u64()?;

        self.load_columns(io)?;
        self.load_indexes(io)?;
        self.open = true;
        debug!("table {} fully loaded", self.name);
        Ok(())
    }

    fn load_columns(&mut self, io: &mut impl BlockIo) -> Result<(), DbError> {
        let mut location = self.column_list_location;
        let mut size = self.column_list_size;
        while location != 0 {
            let bytes = io.read(location, size)?;
            let mut reader = BlockReader::new(&bytes, BlockType::ColumnList)?;
            let _table_id = reader.get_u64()?;
            let count = reader.get_u64()?;
            for _ in 0..count {
                let id = reader.get_u64()?;
                let name = reader.get_name()?;
                let type_tag = reader.get_u8()?;
                let deleted = reader.get_u8()? != 0;
                if !self.columns.contains_key(&name) {
                    let _ = self.columns.insert(
                        name,
                        Column {
                            id,
                            type_tag,
                            deleted,
                        },
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

    fn load_indexes(&mut self, io: &mut impl BlockIo) -> Result<(), DbError> {
        let mut location = self.index_list_location;
        let mut size = self.index_list_size;
        while location != 0 {
            let bytes = io.read(location, size)?;
            let mut reader = BlockReader::new(&bytes, BlockType::IndexList)?;
            let _table_id = reader.get_u64()?;
            let count = reader.get_u64()?;
            for _ in 0..count {
                let id = reader.get_u64()?;
                let column = reader.get_name()?;
                let tree_location = reader.get_u64()?;
                let tree_size = reader.get_u64()?;
                if self.indexes.contains_key(&column) {
                    continue;
                }
                let mut index = Index {
                    id,
                    column: column.clone(),
                    tree_location,
                    tree_size,
                    map: BTreeMap::new(),
                };
                if tree_location != 0 {
                    Self::load_index_tree(io, &mut index)?;
                }
                let _ = self.indexes.insert(column, index);
            }
            if reader.header.prev_invalid {
                break;
            }
            location = reader.header.prev_location;
            size = reader.header.prev_size;
        }
        Ok(())
    }

    fn load_index_tree(io: &mut impl BlockIo, index: &mut Index) -> Result<(), DbError> {
        let bytes = io.read(index.tree_location, index.tree_size)?;
        let mut reader = BlockReader::new(&bytes, BlockType::IndexTree)?;
        let _table_id = reader.get_u64()?;
        let _index_id = reader.get_u64()?;
        let count = reader.get_u64()?;
        for _ in 0..count {
            let key = reader.get_u64()?;
            let location = reader.get_u64()?;
            let size = reader.get_u64()?;
            index.map.entry(key).or_default().push((location, size));
        }
        Ok(())
    }

    /// Declares a column. Redeclaring an existing column with the same type
    /// is a no-op; with a different type it is an error.
    pub(super) fn define_column(
        &mut self,
        name: &str,
        column_type: ColumnType,
    ) -> Result<(), DbError> {
        if name.len() > NAME_LEN {
            return Err(DbError::NameTooLong);
        }
        if let Some(column) = self.columns.get(name) {
            if column.type_tag != column_type.tag() {
                return Err(DbError::TypeMismatch("column redeclared with a different type"));
            }
            return Ok(());
        }
        let id = self.column_next_id;
        self.column_next_id += 1;
        let _ = self.columns.insert(
            name.to_string(),
            Column {
                id,
                type_tag: column_type.tag(),
                deleted: false,
            },
        );
        self.dirty = true;
        Ok(())
    }

    /// Every column a record sets must be declared with a matching type;
    /// a name outside the catalog never widens the schema.
    fn check_columns(&self, record: &Record) -> Result<(), DbError> {
        for (name, value) in record.columns() {
            let column = self
                .columns
                .get(name)
                .ok_or_else(|| DbError::NoSuchColumn(name.clone()))?;
            if column.deleted {
                return Err(DbError::NoSuchColumn(name.clone()));
            }
            if column.type_tag != value.type_tag() {
                return Err(DbError::TypeMismatch("value type differs from the column declaration"));
            }
        }
        Ok(())
    }

    /// Serializes one record version into a data block and appends it to the
    /// chain; large values spill to valuelog blocks first.
    fn append_version(
        &mut self,
        io: &mut impl BlockIo,
        record: &Record,
        deleted: bool,
    ) -> Result<(), DbError> {
        let row_key = record.row_key.unwrap_or_else(|| record.identity());
        let sequence = self.sequence_next;
        self.sequence_next += 1;

        let mut writer =
            BlockWriter::new(BlockType::Data, self.data_head_location, self.data_head_size);
        writer.put_u64(self.id);
        writer.put_u64(row_key);
        writer.put_u64(sequence);
        writer.put_u32(u32::from(deleted));
        writer.put_u32(record.columns().len() as u32);
        for (name, value) in record.columns() {
            let bytes = value.to_bytes();
            writer.put_u32(name.len() as u32);
            writer.put_bytes(name.as_bytes());
            writer.put_u8(value.type_tag());
            if bytes.len() > VALUELOG_SPILL_THRESHOLD {
                if self.valuelog_bytes + bytes.len() as u64 > self.max_valuelog_size {
                    return Err(DbError::ValueTooLarge);
                }
                let mut vl_writer = BlockWriter::new(BlockType::ValueLog, 0, 0);
                vl_writer.put_u64(self.id);
                vl_writer.put_u64(bytes.len() as u64);
                vl_writer.put_bytes(&bytes);
                let vl_bytes = vl_writer.finish();
                let vl_location = io.end();
                io.write(vl_location, &vl_bytes)?;
                self.valuelog_bytes += bytes.len() as u64;

                writer.put_u8(1);
                writer.put_u64(bytes.len() as u64);
                writer.put_u64(vl_location);
                writer.put_u64(vl_bytes.len() as u64);
            } else {
                writer.put_u8(0);
                writer.put_u64(bytes.len() as u64);
                writer.put_bytes(&bytes);
            }
        }

        let bytes = writer.finish();
        let location = io.end();
        io.write(location, &bytes)?;
        self.data_head_location = location;
        self.data_head_size = bytes.len() as u64;
        self.record_count += 1;
        self.dirty = true;

        for index in self.indexes.values_mut() {
            if let Some(value) = record.get_value(&index.column) {
                index
                    .map
                    .entry(value.key_hash())
                    .or_default()
                    .push((location, bytes.len() as u64));
            }
        }
        trace!("table {} version {sequence} at {location:#x}", self.name);
        Ok(())
    }

    pub(super) fn upsert(&mut self, io: &mut impl BlockIo, record: &Record) -> Result<(), DbError> {
        if self.record_count >= self.max_records {
            return Err(DbError::TableFull);
        }
        self.check_columns(record)?;
        self.append_version(io, record, false)
    }

    pub(super) fn delete(&mut self, io: &mut impl BlockIo, record: &Record) -> Result<(), DbError> {
        self.append_version(io, record, true)
    }

    fn decode_version(
        &self,
        io: &mut impl BlockIo,
        bytes: &[u8],
        table: TableRef,
    ) -> Result<(VersionedRecord, u64, u64), DbError> {
        let mut reader = BlockReader::new(bytes, BlockType::Data)?;
        let _table_id = reader.get_u64()?;
        let row_key = reader.get_u64()?;
        let sequence = reader.get_u64()?;
        let deleted = reader.get_u32()? != 0;
        let column_count = reader.get_u32()?;
        let mut record = Record::new(table);
        record.row_key = Some(row_key);
        record.sequence = sequence;
        record.set_deleted(deleted);
        for _ in 0..column_count {
            let name_len = reader.get_u32()? as usize;
            let name = core::str::from_utf8(reader.get_bytes(name_len)?)
                .map_err(|_| DbError::ShortBlock)?
                .to_string();
            let type_tag = reader.get_u8()?;
            let storage = reader.get_u8()?;
            let data_len = reader.get_u64()? as usize;
            let value = if storage == 0 {
                Value::from_bytes(type_tag, reader.get_bytes(data_len)?)?
            } else {
                let vl_location = reader.get_u64()?;
                let vl_size = reader.get_u64()?;
                let vl_bytes = io.read(vl_location, vl_size)?;
                let mut vl_reader = BlockReader::new(&vl_bytes, BlockType::ValueLog)?;
                let _table_id = vl_reader.get_u64()?;
                let length = vl_reader.get_u64()? as usize;
                if length != data_len {
                    return Err(DbError::ShortBlock);
                }
                Value::from_bytes(type_tag, vl_reader.get_bytes(length)?)?
            };
            record.insert_raw(name, value);
        }
        let (prev_location, prev_size) = if reader.header.prev_invalid {
            (0, 0)
        } else {
            (reader.header.prev_location, reader.header.prev_size)
        };
        Ok((VersionedRecord { record }, prev_location, prev_size))
    }

    /// Collects candidate versions: index lookup when the probe sets an
    /// indexed column, a full chain walk otherwise.
    fn collect_versions(
        &self,
        io: &mut impl BlockIo,
        probe: &Record,
        table: TableRef,
    ) -> Result<Vec<VersionedRecord>, DbError> {
        let mut versions = Vec::new();

        let indexed = probe.columns().iter().find_map(|(name, value)| {
            self.indexes
                .get(name)
                .map(|index| (index, value.key_hash()))
        });

        if let Some((index, key)) = indexed {
            if let Some(locations) = index.map.get(&key) {
                for &(location, size) in locations {
                    match io.read(location, size) {
                        Ok(bytes) => match self.decode_version(io, &bytes, table) {
                            Ok((version, _, _)) => versions.push(version),
                            Err(err) => error!("damaged record at {location:#x}: {err:?}"),
                        },
                        Err(err) => error!("unreadable record at {location:#x}: {err:?}"),
                    }
                }
            }
            return Ok(versions);
        }

        let mut location = self.data_head_location;
        let mut size = self.data_head_size;
        while location != 0 {
            let bytes = match io.read(location, size) {
                Ok(bytes) => bytes,
                Err(err) => {
                    error!("broken data chain at {location:#x}: {err:?}");
                    break;
                }
            };
            match self.decode_version(io, &bytes, table) {
                Ok((version, prev_location, prev_size)) => {
                    versions.push(version);
                    location = prev_location;
                    size = prev_size;
                }
                Err(err) => {
                    error!("damaged record at {location:#x}: {err:?}");
                    break;
                }
            }
        }
        Ok(versions)
    }

    /// Search semantics: newest version per row, deleted rows filtered,
    /// ordered newest first.
    pub(super) fn search(
        &mut self,
        io: &mut impl BlockIo,
        probe: &Record,
    ) -> Result<Vec<Record>, DbError> {
        let table = probe.table();
        let versions = self.collect_versions(io, probe, table)?;

        let mut newest: BTreeMap<u64, Record> = BTreeMap::new();
        for version in versions {
            let record = version.record;
            let key = record.row_key.unwrap_or(0);
            match newest.get(&key) {
                Some(existing) if existing.sequence >= record.sequence => {}
                _ => {
                    let _ = newest.insert(key, record);
                }
            }
        }

        let mut matches: Vec<Record> = newest
            .into_values()
            .filter(|record| !record.is_deleted() && record.matches(probe))
            .collect();
        matches.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(matches)
    }

    pub(super) fn create_index(
        &mut self,
        io: &mut impl BlockIo,
        column: &str,
    ) -> Result<(), DbError> {
        if self.indexes.contains_key(column) {
            return Ok(());
        }
        let id = self.index_next_id;
        self.index_next_id += 1;
        let mut index = Index {
            id,
            column: column.to_string(),
            tree_location: 0,
            tree_size: 0,
            map: BTreeMap::new(),
        };

        // Index existing rows with one chain walk.
        let mut location = self.data_head_location;
        let mut size = self.data_head_size;
        while location != 0 {
            let bytes = io.read(location, size)?;
            let probe_table = TableRef {
                database: 0,
                table: self.id,
            };
            let (version, prev_location, prev_size) =
                self.decode_version(io, &bytes, probe_table)?;
            if let Some(value) = version.record.get_value(column) {
                index
                    .map
                    .entry(value.key_hash())
                    .or_default()
                    .push((location, size));
            }
            location = prev_location;
            size = prev_size;
        }

        let _ = self.indexes.insert(column.to_string(), index);
        self.dirty = true;
        Ok(())
    }

    /// Writes the column list, one index tree per index, the index list, and
    /// finally the table entity block.
    pub(super) fn persist(&mut self, io: &mut impl BlockIo) -> Result<(), DbError> {
        let mut writer = BlockWriter::new(
            BlockType::ColumnList,
            self.column_list_location,
            self.column_list_size,
        );
        writer.put_u64(self.id);
        writer.put_u64(self.columns.len() as u64);
        for (name, column) in &self.columns {
            writer.put_u64(column.id);
            writer.put_name(name);
            writer.put_u8(column.type_tag);
            writer.put_u8(u8::from(column.deleted));
        }
        let bytes = writer.finish();
        let location = io.end();
        io.write(location, &bytes)?;
        self.column_list_location = location;
        self.column_list_size = bytes.len() as u64;

        for index in self.indexes.values_mut() {
            let mut writer = BlockWriter::new(BlockType::IndexTree, 0, 0);
            writer.put_u64(self.id);
            writer.put_u64(index.id);
            let count: usize = index.map.values().map(Vec::len).sum();
            writer.put_u64(count as u64);
            for (key, locations) in &index.map {
                for &(location, size) in locations {
                    writer.put_u64(*key);
                    writer.put_u64(location);
                    writer.put_u64(size);
                }
            }
            let bytes = writer.finish();
            let location = io.end();
            io.write(location, &bytes)?;
            index.tree_location = location;
            index.tree_size = bytes.len() as u64;
        }

        let mut writer = BlockWriter::new(
            BlockType::IndexList,
            self.index_list_location,
            self.index_list_size,
        );
        writer.put_u64(self.id);
        writer.put_u64(self.indexes.len() as u64);
        for index in self.indexes.values() {
            writer.put_u64(index.id);
            writer.put_name(&index.column);
            writer.put_u64(index.tree_location);
            writer.put_u64(index.tree_size);
        }
        let bytes = writer.finish();
        let location = io.end();
        io.write(location, &bytes)?;
        self.index_list_location = location;
        self.index_list_size = bytes.len() as u64;

        let mut writer = BlockWriter::new(
            BlockType::Table,
            self.metadata_location,
            self.metadata_size,
        );
        writer.put_u64(self.id);
        writer.put_name(&self.name);
        writer.put_u8(u8::from(self.deleted));
        writer.put_u64(self.column_next_id);
        writer.put_u64(self.index_next_id);
        writer.put_u64(self.sequence_next);
        writer.put_u64(self.record_count);
        writer.put_u64(self.valuelog_bytes);
        writer.put_u64(self.column_list_location);
        writer.put_u64(self.column_list_size);
        writer.put_u64(self.index_list_location);
        writer.put_u64(self.index_list_size);
        writer.put_u64(self.data_head_location);
        writer.put_u64(self.data_head_size);
        let bytes = writer.finish();
        let location = io.end();
        io.write(location, &bytes)?;
        self.metadata_location = location;
        self.metadata_size = bytes.len() as u64;
        self.dirty = false;
        Ok(())
    }
}
