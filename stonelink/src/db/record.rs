//! Records and typed column values.

use alloc::{
    collections::BTreeMap,
    string::{String, ToString},
    vec::Vec,
};

use super::{DbError, TableRef};

/// Declared type of a table column. Every column a record sets must have
/// been declared with a matching type before the record can be stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 16-bit integer.
    U16,
    /// Unsigned 32-bit integer.
    U32,
    /// Unsigned 64-bit integer.
    U64,
    /// Signed 64-bit integer.
    I64,
    /// UTF-8 string.
    Str,
    /// Raw byte array.
    Bytes,
}

impl ColumnType {
    pub(crate) fn tag(self) -> u8 {
        match self {
            ColumnType::U8 => 1,
            ColumnType::U16 => 2,
            ColumnType::U32 => 3,
            ColumnType::U64 => 4,
            ColumnType::I64 => 5,
            ColumnType::Str => 6,
            ColumnType::Bytes => 7,
        }
    }
}

/// A typed column value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// Unsigned 8-bit integer.
    U8(u8),
    /// Unsigned 16-bit integer.
    U16(u16),
    /// Unsigned 32-bit integer.
    U32(u32),
    /// Unsigned 64-bit integer.
    U64(u64),
    /// Signed 64-bit integer.
    I64(i64),
    /// UTF-8 string.
    Str(String),
    /// Raw byte array.
    Bytes(Vec<u8>),
}

impl Value {
    pub(crate) fn type_tag(&self) -> u8 {
        match self {
            Value::U8(_) => 1,
            Value::U16(_) => 2,
            Value::U32(_) => 3,
            Value::U64(_) => 4,
            Value::I64(_) => 5,
            Value::Str(_) => 6,
            Value::Bytes(_) => 7,
        }
    }

    /// Canonical little-endian byte image, used for storage and key hashing.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::U8(v) => v.to_le_bytes().to_vec(),
            Value::U16(v) => v.to_le_bytes().to_vec(),
            Value::U32(v) => v.to_le_bytes().to_vec(),
            Value::U64(v) => v.to_le_bytes().to_vec(),
            Value::I64(v) => v.to_le_bytes().to_vec(),
            Value::Str(v) => v.as_bytes().to_vec(),
            Value::Bytes(v) => v.clone(),
        }
    }

    pub(crate) fn from_bytes(tag: u8, bytes: &[u8]) -> Result<Self, DbError> {
        let fixed = |expected: usize| {
            if bytes.len() == expected {
                Ok(())
            } else {
                Err(DbError::ShortBlock)
            }
        };
        match tag {
            1 => {
                fixed(1)?;
                Ok(Value::U8(bytes[0]))
            }
            2 => {
                fixed(2)?;
                Ok(Value::U16(u16::from_le_bytes(bytes.try_into().unwrap())))
            }
            3 => {
                fixed(4)?;
                Ok(Value::U32(u32::from_le_bytes(bytes.try_into().unwrap())))
            }
            4 => {
                fixed(8)?;
                Ok(Value::U64(u64::from_le_bytes(bytes.try_into().unwrap())))
            }
            5 => {
                fixed(8)?;
                Ok(Value::I64(i64::from_le_bytes(bytes.try_into().unwrap())))
            }
            6 => core::str::from_utf8(bytes)
                .map(|s| Value::Str(s.to_string()))
                .map_err(|_| DbError::ShortBlock),
            7 => Ok(Value::Bytes(bytes.to_vec())),
            _ => Err(DbError::TypeMismatch("unknown column type tag")),
        }
    }

    /// FNV-1a over the type tag and the canonical bytes; used as index key
    /// and as the derived row identity.
    pub(crate) fn key_hash(&self) -> u64 {
        fnv1a(self.type_tag(), &self.to_bytes())
    }
}

pub(crate) fn fnv1a(seed: u8, bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    hash ^= u64::from(seed);
    hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// A record under construction or returned from a search. Columns set on a
/// probe record become the search predicate; on upsert they become the new
/// version of the row.
#[derive(Clone, Debug)]
pub struct Record {
    table: TableRef,
    columns: BTreeMap<String, Value>,
    deleted: bool,
    /// Assigned once stored; rows with an `id` column use its hash.
    pub(crate) row_key: Option<u64>,
    /// Monotonic per-table version stamp, newest wins.
    pub(crate) sequence: u64,
}

impl Record {
    pub(crate) fn new(table: TableRef) -> Self {
        Self {
            table,
            columns: BTreeMap::new(),
            deleted: false,
            row_key: None,
            sequence: 0,
        }
    }

    /// The table this record binds to.
    #[must_use]
    pub fn table(&self) -> TableRef {
        self.table
    }

    /// Whether this version carries the logical-delete flag.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub(crate) fn set_deleted(&mut self, deleted: bool) {
        self.deleted = deleted;
    }

    pub(crate) fn columns(&self) -> &BTreeMap<String, Value> {
        &self.columns
    }

    pub(crate) fn insert_raw(&mut self, name: String, value: Value) {
        let _ = self.columns.insert(name, value);
    }

    /// Row identity: the `id` column when present, otherwise a hash over
    /// every set column, so identical content revises the same row.
    pub(crate) fn identity(&self) -> u64 {
        if let Some(id) = self.columns.get("id") {
            return id.key_hash();
        }
        let mut hash: u64 = 0;
        for (name, value) in &self.columns {
            hash ^= fnv1a(0, name.as_bytes()) ^ value.key_hash();
        }
        hash
    }

    /// Sets `column` to `value`. The table's declarations are enforced at
    /// upsert: a column outside the catalog never widens the schema and
    /// fails the commit instead.
    pub fn set_value(&mut self, column: &str, value: Value) -> &mut Self {
        let _ = self.columns.insert(column.to_string(), value);
        self
    }

    /// The currently set value of `column`, if any.
    #[must_use]
    pub fn get_value(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    /// Sets an unsigned 8-bit column.
    pub fn set_u8(&mut self, column: &str, value: u8) -> &mut Self {
        self.set_value(column, Value::U8(value))
    }

    /// Sets an unsigned 16-bit column.
    pub fn set_u16(&mut self, column: &str, value: u16) -> &mut Self {
        self.set_value(column, Value::U16(value))
    }

    /// Sets an unsigned 32-bit column.
    pub fn set_u32(&mut self, column: &str, value: u32) -> &mut Self {
        self.set_value(column, Value::U32(value))
    }

    /// Sets an unsigned 64-bit column.
    pub fn set_u64(&mut self, column: &str, value: u64) -> &mut Self {
        self.set_value(column, Value::U64(value))
    }

    /// Sets a signed 64-bit column.
    pub fn set_i64(&mut self, column: &str, value: i64) -> &mut Self {
        self.set_value(column, Value::I64(value))
    }

    /// Sets a string column.
    pub fn set_string(&mut self, column: &str, value: &str) -> &mut Self {
        self.set_value(column, Value::Str(value.to_string()))
    }

    /// Sets a byte-array column.
    pub fn set_bytes(&mut self, column: &str, value: &[u8]) -> &mut Self {
        self.set_value(column, Value::Bytes(value.to_vec()))
    }

    /// Reads an unsigned 8-bit column.
    pub fn get_u8(&self, column: &str) -> Result<u8, DbError> {
        match self.columns.get(column) {
            Some(Value::U8(v)) => Ok(*v),
            Some(_) => Err(DbError::TypeMismatch("u8")),
            None => Err(DbError::NoSuchColumn(column.to_string())),
        }
    }

    /// Reads an unsigned 16-bit column.
    pub fn get_u16(&self, column: &str) -> Result<u16, DbError> {
        match self.columns.get(column) {
            Some(Value::U16(v)) => Ok(*v),
            Some(_) => Err(DbError::TypeMismatch("u16")),
            None => Err(DbError::NoSuchColumn(column.to_string())),
        }
    }

    /// Reads an unsigned 32-bit column.
    pub fn get_u32(&self, column: &str) -> Result<u32, DbError> {
        match self.columns.get(column) {
            Some(Value::U32(v)) => Ok(*v),
            Some(_) => Err(DbError::TypeMismatch("u32")),
            None => Err(DbError::NoSuchColumn(column.to_string())),
        }
    }

    /// Reads an unsigned 64-bit column.
    pub fn get_u64(&self, column: &str) -> Result<u64, DbError> {
        match self.columns.get(column) {
            Some(Value::U64(v)) => Ok(*v),
            Some(_) => Err(DbError::TypeMismatch("u64")),
            None => Err(DbError::NoSuchColumn(column.to_string())),
        }
    }

    /// Reads a signed 64-bit column.
    pub fn get_i64(&self, column: &str) -> Result<i64, DbError> {
        match self.columns.get(column) {
            Some(Value::I64(v)) => Ok(*v),
            Some(_) => Err(DbError::TypeMismatch("i64")),
            None => Err(DbError::NoSuchColumn(column.to_string())),
        }
    }

    /// Reads a string column.
    pub fn get_string(&self, column: &str) -> Result<&str, DbError> {
        match self.columns.get(column) {
            Some(Value::Str(v)) => Ok(v),
            Some(_) => Err(DbError::TypeMismatch("string")),
            None => Err(DbError::NoSuchColumn(column.to_string())),
        }
    }

    /// Reads a byte-array column.
    pub fn get_bytes(&self, column: &str) -> Result<&[u8], DbError> {
        match self.columns.get(column) {
            Some(Value::Bytes(v)) => Ok(v),
            Some(_) => Err(DbError::TypeMismatch("bytes")),
            None => Err(DbError::NoSuchColumn(column.to_string())),
        }
    }

    /// True when every column set in `probe` equals this record's value.
    pub(crate) fn matches(&self, probe: &Record) -> bool {
        probe
            .columns
            .iter()
            .all(|(name, value)| self.columns.get(name) == Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableRef {
        TableRef {
            database: 1,
            table: 1,
        }
    }

    #[test]
    fn typed_setters_and_getters() {
        let mut record = Record::new(table());
        let _ = record
            .set_u64("id", 7)
            .set_string("name", "alpha")
            .set_bytes("value", &[1, 2, 3]);
        assert_eq!(record.get_u64("id").unwrap(), 7);
        assert_eq!(record.get_string("name").unwrap(), "alpha");
        assert_eq!(record.get_bytes("value").unwrap(), &[1, 2, 3]);
        assert_eq!(record.get_u64("name"), Err(DbError::TypeMismatch("u64")));
        assert!(matches!(record.get_u64("nope"), Err(DbError::NoSuchColumn(_))));
    }

    #[test]
    fn identity_prefers_id_column() {
        let mut a = Record::new(table());
        let _ = a.set_u64("id", 9).set_string("name", "a");
        let mut b = Record::new(table());
        let _ = b.set_u64("id", 9).set_string("name", "b");
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn value_round_trip() {
        for value in [
            Value::U8(1),
            Value::U16(2),
            Value::U32(3),
            Value::U64(4),
            Value::I64(-5),
            Value::Str("hello".into()),
            Value::Bytes(alloc::vec![9, 9, 9]),
        ] {
            let decoded = Value::from_bytes(value.type_tag(), &value.to_bytes()).unwrap();
            assert_eq!(decoded, value);
        }
    }
}
