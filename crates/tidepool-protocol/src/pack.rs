//! Ordered, typed parameter packs carried by commands and responses.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tidepool_io::{StorageError, StorageResult};

/// One typed value in a [`Pack`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackValue {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Unsigned integer.
    U64(u64),
    /// Signed integer.
    I64(i64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes.
    Bin(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Nested pack.
    Pack(Pack),
}

impl PackValue {
    fn type_name(&self) -> &'static str {
        match self {
            PackValue::Null => "null",
            PackValue::Bool(_) => "bool",
            PackValue::U64(_) => "u64",
            PackValue::I64(_) => "i64",
            PackValue::Str(_) => "str",
            PackValue::Bin(_) => "bin",
            PackValue::Pack(_) => "pack",
        }
    }
}

/// Ordered list of typed values. Readers consume values in the order they were written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pack {
    values: Vec<PackValue>,
}

impl Pack {
    /// Create an empty pack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw value.
    pub fn value(mut self, value: PackValue) -> Self {
        self.values.push(value);
        self
    }

    /// Append a bool.
    pub fn bool(self, value: bool) -> Self {
        self.value(PackValue::Bool(value))
    }

    /// Append an unsigned integer.
    pub fn u64(self, value: u64) -> Self {
        self.value(PackValue::U64(value))
    }

    /// Append a signed integer.
    pub fn i64(self, value: i64) -> Self {
        self.value(PackValue::I64(value))
    }

    /// Append a string.
    pub fn str(self, value: impl Into<String>) -> Self {
        self.value(PackValue::Str(value.into()))
    }

    /// Append an optional string, `None` becoming [`PackValue::Null`].
    pub fn str_opt(self, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.str(value),
            None => self.value(PackValue::Null),
        }
    }

    /// Append an optional unsigned integer.
    pub fn u64_opt(self, value: Option<u64>) -> Self {
        match value {
            Some(value) => self.u64(value),
            None => self.value(PackValue::Null),
        }
    }

    /// Append raw bytes.
    pub fn bin(self, value: Vec<u8>) -> Self {
        self.value(PackValue::Bin(value))
    }

    /// Append a nested pack.
    pub fn pack(self, value: Pack) -> Self {
        self.value(PackValue::Pack(value))
    }

    /// Append any serializable value as an encoded binary.
    pub fn serde<T: Serialize>(self, value: &T) -> StorageResult<Self> {
        let bytes = bincode::serialize(value)
            .map_err(|e| StorageError::Format(format!("unable to encode pack value: {}", e)))?;
        Ok(self.bin(bytes))
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when the pack holds no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Start reading values from the front.
    pub fn reader(&self) -> PackReader<'_> {
        PackReader {
            values: &self.values,
            pos: 0,
        }
    }
}

/// Sequential typed reader over a [`Pack`].
#[derive(Debug)]
pub struct PackReader<'a> {
    values: &'a [PackValue],
    pos: usize,
}

impl<'a> PackReader<'a> {
    fn next(&mut self, expected: &str) -> StorageResult<&'a PackValue> {
        let value = self.values.get(self.pos).ok_or_else(|| {
            StorageError::Format(format!(
                "expected {} at pack position {} but pack has {} values",
                expected,
                self.pos,
                self.values.len()
            ))
        })?;
        self.pos += 1;
        Ok(value)
    }

    fn mismatch(&self, expected: &str, found: &PackValue) -> StorageError {
        StorageError::Format(format!(
            "expected {} at pack position {} but found {}",
            expected,
            self.pos - 1,
            found.type_name()
        ))
    }

    /// Read a bool.
    pub fn bool(&mut self) -> StorageResult<bool> {
        match self.next("bool")? {
            PackValue::Bool(v) => Ok(*v),
            other => Err(self.mismatch("bool", other)),
        }
    }

    /// Read an unsigned integer.
    pub fn u64(&mut self) -> StorageResult<u64> {
        match self.next("u64")? {
            PackValue::U64(v) => Ok(*v),
            other => Err(self.mismatch("u64", other)),
        }
    }

    /// Read an optional unsigned integer.
    pub fn u64_opt(&mut self) -> StorageResult<Option<u64>> {
        match self.next("u64")? {
            PackValue::Null => Ok(None),
            PackValue::U64(v) => Ok(Some(*v)),
            other => Err(self.mismatch("u64", other)),
        }
    }

    /// Read a signed integer.
    pub fn i64(&mut self) -> StorageResult<i64> {
        match self.next("i64")? {
            PackValue::I64(v) => Ok(*v),
            other => Err(self.mismatch("i64", other)),
        }
    }

    /// Read a string.
    pub fn str(&mut self) -> StorageResult<String> {
        match self.next("str")? {
            PackValue::Str(v) => Ok(v.clone()),
            other => Err(self.mismatch("str", other)),
        }
    }

    /// Read an optional string.
    pub fn str_opt(&mut self) -> StorageResult<Option<String>> {
        match self.next("str")? {
            PackValue::Null => Ok(None),
            PackValue::Str(v) => Ok(Some(v.clone())),
            other => Err(self.mismatch("str", other)),
        }
    }

    /// Read raw bytes.
    pub fn bin(&mut self) -> StorageResult<Vec<u8>> {
        match self.next("bin")? {
            PackValue::Bin(v) => Ok(v.clone()),
            other => Err(self.mismatch("bin", other)),
        }
    }

    /// Read a nested pack.
    pub fn pack(&mut self) -> StorageResult<Pack> {
        match self.next("pack")? {
            PackValue::Pack(v) => Ok(v.clone()),
            other => Err(self.mismatch("pack", other)),
        }
    }

    /// Read a value written with [`Pack::serde`].
    pub fn serde<T: DeserializeOwned>(&mut self) -> StorageResult<T> {
        let bytes = self.bin()?;
        bincode::deserialize(&bytes)
            .map_err(|e| StorageError::Format(format!("unable to decode pack value: {}", e)))
    }

    /// True when every value has been read.
    pub fn is_end(&self) -> bool {
        self.pos >= self.values.len()
    }
}
