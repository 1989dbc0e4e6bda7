//! Minimal table schema: declared indexes and their key extraction
//!
//! The key of a row for an index is a fixed byte range of the row.

use super::index::IndexKey;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Key representation of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    /// Variable-length byte string, lexicographic order
    Bytes,
    /// 8-byte little-endian unsigned integer
    U64,
    /// 8-byte little-endian signed integer
    I64,
}

impl KeyType {
    /// Compare two encoded keys in this type's order
    ///
    /// Keys that fail to decode sort after valid ones, bytewise among themselves.
    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            KeyType::Bytes => a.cmp(b),
            KeyType::U64 => cmp_decoded::<u64>(a, b),
            KeyType::I64 => cmp_decoded::<i64>(a, b),
        }
    }

    /// Fixed encoded width, if any
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            KeyType::Bytes => None,
            KeyType::U64 | KeyType::I64 => Some(8),
        }
    }
}

fn cmp_decoded<K: IndexKey>(a: &[u8], b: &[u8]) -> Ordering {
    match (K::decode(a), K::decode(b)) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Declaration of one index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub unique: bool,
    pub key_type: KeyType,
    /// Start of the key within the row
    pub offset: usize,
    /// Key length; `None` runs to the end of the row
    pub len: Option<usize>,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, key_type: KeyType, offset: usize, len: Option<usize>) -> Self {
        Self {
            name: name.into(),
            unique: false,
            key_type,
            offset,
            len: len.or(key_type.fixed_len()),
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Reject declarations whose keys could never decode
    pub fn validate(&self) -> Result<()> {
        if let Some(width) = self.key_type.fixed_len() {
            if self.len != Some(width) {
                return Err(Error::InvalidArgument(format!(
                    "Index '{}' of type {:?} needs a {}-byte key, declared {:?}",
                    self.name, self.key_type, width, self.len
                )));
            }
        }
        Ok(())
    }

    /// Borrow this index's key out of `row`
    pub fn extract_key<'a>(&self, row: &'a [u8]) -> Result<&'a [u8]> {
        let end = match self.len {
            Some(len) => self.offset + len,
            None => row.len(),
        };
        if self.offset > row.len() || end > row.len() {
            return Err(Error::InvalidArgument(format!(
                "Row of {} bytes too short for key '{}' at {}..{}",
                row.len(),
                self.name,
                self.offset,
                end
            )));
        }
        Ok(&row[self.offset..end])
    }
}

/// Index layout of a table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub indexes: Vec<IndexSpec>,
}

impl TableSchema {
    pub fn new(indexes: Vec<IndexSpec>) -> Self {
        Self { indexes }
    }

    /// Check every index declaration and that names are distinct
    pub fn validate(&self) -> Result<()> {
        for (i, spec) in self.indexes.iter().enumerate() {
            spec.validate()?;
            if self.indexes[..i].iter().any(|other| other.name == spec.name) {
                return Err(Error::InvalidArgument(format!(
                    "Index name '{}' declared twice",
                    spec.name
                )));
            }
        }
        Ok(())
    }

    pub fn index(&self, index_id: usize) -> Result<&IndexSpec> {
        self.indexes
            .get(index_id)
            .ok_or_else(|| Error::InvalidArgument(format!("No index #{}", index_id)))
    }

    pub fn index_id(&self, name: &str) -> Option<usize> {
        self.indexes.iter().position(|spec| spec.name == name)
    }

    /// Keys of `row` for every declared index, in declaration order
    pub fn extract_keys<'a>(&self, row: &'a [u8]) -> Result<Vec<&'a [u8]>> {
        self.indexes.iter().map(|spec| spec.extract_key(row)).collect()
    }
}
