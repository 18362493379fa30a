//! Parsed-result registry: a reference-counted heterogeneous mapping from
//! string keys to tagged values, built incrementally by parsers and
//! consumed read-only by callers.

use core::fmt;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    InvalidArguments,
    NotFound,
    TypeMismatch,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::InvalidArguments => f.write_str("invalid arguments"),
            RegistryError::NotFound => f.write_str("key not found"),
            RegistryError::TypeMismatch => f.write_str("value has a different type"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for RegistryError {}

/// Tagged union over the value types a sub-protocol parser may produce.
/// Immutable after construction.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    U8(u8),
    U32(u32),
    ByteArray(Vec<u8>),
    U16Array(Vec<u16>),
}

struct Entry {
    key: String,
    value: Value,
}

/// Reference-counted container holding a sequence of (key, value) pairs.
/// Re-adding an existing key prepends a new binding; lookup returns the
/// most recently added binding of matching type, preserving legacy
/// "prepend-on-add" linked-list semantics.
#[derive(Clone)]
pub struct ResultMap {
    entries: Rc<RefCell<Vec<Entry>>>,
}

impl Default for ResultMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultMap {
    pub fn new() -> Self {
        ResultMap {
            entries: Rc::new(RefCell::new(Vec::new())),
        }
    }

    fn prepend(&self, key: &str, value: Value) -> std::result::Result<(), RegistryError> {
        if key.is_empty() {
            return Err(RegistryError::InvalidArguments);
        }
        self.entries.borrow_mut().insert(
            0,
            Entry {
                key: key.to_string(),
                value,
            },
        );
        Ok(())
    }

    pub fn add_string(&self, key: &str, value: impl Into<String>) -> std::result::Result<(), RegistryError> {
        self.prepend(key, Value::String(value.into()))
    }

    pub fn add_u8(&self, key: &str, value: u8) -> std::result::Result<(), RegistryError> {
        self.prepend(key, Value::U8(value))
    }

    pub fn add_u32(&self, key: &str, value: u32) -> std::result::Result<(), RegistryError> {
        self.prepend(key, Value::U32(value))
    }

    pub fn add_byte_array(&self, key: &str, value: impl Into<Vec<u8>>) -> std::result::Result<(), RegistryError> {
        self.prepend(key, Value::ByteArray(value.into()))
    }

    pub fn add_u16_array(&self, key: &str, value: impl Into<Vec<u16>>) -> std::result::Result<(), RegistryError> {
        self.prepend(key, Value::U16Array(value.into()))
    }

    /// Returns the most recently added binding for `key`, regardless of type.
    fn find(&self, key: &str) -> Option<Value> {
        self.entries
            .borrow()
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.clone())
    }

    pub fn get_string(&self, key: &str) -> std::result::Result<String, RegistryError> {
        match self.find(key) {
            None => Err(RegistryError::NotFound),
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(RegistryError::TypeMismatch),
        }
    }

    pub fn get_u8(&self, key: &str) -> std::result::Result<u8, RegistryError> {
        match self.find(key) {
            None => Err(RegistryError::NotFound),
            Some(Value::U8(v)) => Ok(v),
            Some(_) => Err(RegistryError::TypeMismatch),
        }
    }

    pub fn get_u32(&self, key: &str) -> std::result::Result<u32, RegistryError> {
        match self.find(key) {
            None => Err(RegistryError::NotFound),
            Some(Value::U32(v)) => Ok(v),
            Some(_) => Err(RegistryError::TypeMismatch),
        }
    }

    pub fn get_byte_array(&self, key: &str) -> std::result::Result<Vec<u8>, RegistryError> {
        match self.find(key) {
            None => Err(RegistryError::NotFound),
            Some(Value::ByteArray(v)) => Ok(v),
            Some(_) => Err(RegistryError::TypeMismatch),
        }
    }

    pub fn get_u16_array(&self, key: &str) -> std::result::Result<Vec<u16>, RegistryError> {
        match self.find(key) {
            None => Err(RegistryError::NotFound),
            Some(Value::U16Array(v)) => Ok(v),
            Some(_) => Err(RegistryError::TypeMismatch),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepend_on_add_returns_most_recent() {
        let m = ResultMap::new();
        m.add_u32("rssi", 10).unwrap();
        m.add_u32("rssi", 17).unwrap();
        assert_eq!(m.get_u32("rssi").unwrap(), 17);
    }

    #[test]
    fn type_mismatch_does_not_touch_state() {
        let m = ResultMap::new();
        m.add_u32("rssi", 17).unwrap();
        assert_eq!(m.get_string("rssi").unwrap_err(), RegistryError::TypeMismatch);
        assert_eq!(m.get_u32("rssi").unwrap(), 17);
    }

    #[test]
    fn not_found() {
        let m = ResultMap::new();
        assert_eq!(m.get_u32("missing").unwrap_err(), RegistryError::NotFound);
    }

    #[test]
    fn empty_key_is_invalid() {
        let m = ResultMap::new();
        assert_eq!(
            m.add_string("", "x").unwrap_err(),
            RegistryError::InvalidArguments
        );
    }

    #[test]
    fn clone_shares_storage() {
        let m = ResultMap::new();
        let m2 = m.clone();
        m.add_u8("x", 1).unwrap();
        assert_eq!(m2.get_u8("x").unwrap(), 1);
    }

    #[test]
    fn preserves_insertion_order_for_distinct_keys() {
        let m = ResultMap::new();
        m.add_string("a", "1").unwrap();
        m.add_string("b", "2").unwrap();
        assert_eq!(m.get_string("a").unwrap(), "1");
        assert_eq!(m.get_string("b").unwrap(), "2");
    }
}
