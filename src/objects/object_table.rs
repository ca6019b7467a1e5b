use std::collections::HashMap;

use crate::error::{ErrorKind, RuntimeError};
use crate::objects::object::Handle;
use crate::value::Value;

/// Normalized table key. Integral floats collapse to `Int` so `1` and
/// `1.0` address the same slot; nil and NaN are out of the key domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKey {
    Bool(bool),
    Int(i64),
    NumberBits(u64),
    Str(Handle),
    Obj(Handle),
    Thread(usize),
}

impl TableKey {
    pub fn from_value(value: &Value) -> Result<TableKey, RuntimeError> {
        match value {
            Value::Nil => Err(RuntimeError::new(ErrorKind::Index, "table index is nil")),
            Value::Bool(b) => Ok(TableKey::Bool(*b)),
            Value::Number(n) => {
                if n.is_nan() {
                    return Err(RuntimeError::new(ErrorKind::Index, "table index is NaN"));
                }
                if n.fract() == 0.0 && *n >= i64::MIN as f64 && *n <= i64::MAX as f64 {
                    Ok(TableKey::Int(*n as i64))
                } else {
                    Ok(TableKey::NumberBits(n.to_bits()))
                }
            }
            Value::String(h) => Ok(TableKey::Str(*h)),
            Value::Table(h) | Value::Function(h) | Value::Userdata(h) => Ok(TableKey::Obj(*h)),
            Value::Thread(id) => Ok(TableKey::Thread(*id)),
        }
    }
}

/// The script-visible table object: a dense 1-based array part, a hash
/// part for everything else, and an optional metatable.
pub struct ObjectTable {
    pub array: Vec<Value>,
    pub map: HashMap<TableKey, Value>,
    pub metatable: Option<Handle>,
}

impl ObjectTable {
    pub fn new() -> ObjectTable {
        ObjectTable {
            array: Vec::new(),
            map: HashMap::new(),
            metatable: None,
        }
    }

    pub fn get(&self, key: &TableKey) -> Value {
        if let TableKey::Int(i) = key {
            if *i >= 1 && (*i as usize) <= self.array.len() {
                return self.array[*i as usize - 1];
            }
        }
        self.map.get(key).copied().unwrap_or(Value::Nil)
    }

    pub fn set(&mut self, key: TableKey, value: Value) {
        if let TableKey::Int(i) = key {
            if i >= 1 && (i as usize) <= self.array.len() {
                self.array[i as usize - 1] = value;
                return;
            }
            // Appending extends the dense part; anything else falls through
            // to the hash part.
            if i as usize == self.array.len() + 1 {
                self.array.push(value);
                return;
            }
        }
        if value.is_nil() {
            self.map.remove(&key);
        } else {
            self.map.insert(key, value);
        }
    }

    /// Length of the dense prefix, the script-visible `#` length.
    pub fn len(&self) -> usize {
        self.array.iter().take_while(|v| !v.is_nil()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn payload_size(&self) -> usize {
        self.array.capacity() * std::mem::size_of::<Value>()
            + self.map.capacity() * (std::mem::size_of::<TableKey>() + std::mem::size_of::<Value>())
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        ObjectTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_floats_collapse_to_int_keys() {
        let a = TableKey::from_value(&Value::Number(3.0)).unwrap();
        let b = TableKey::from_value(&Value::Number(3.0)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, TableKey::Int(3));
    }

    #[test]
    fn nil_and_nan_keys_are_rejected() {
        assert_eq!(
            TableKey::from_value(&Value::Nil).unwrap_err().kind,
            ErrorKind::Index
        );
        assert_eq!(
            TableKey::from_value(&Value::Number(f64::NAN)).unwrap_err().kind,
            ErrorKind::Index
        );
    }

    #[test]
    fn sequential_int_keys_use_the_array_part() {
        let mut table = ObjectTable::new();
        table.set(TableKey::Int(1), Value::Number(10.0));
        table.set(TableKey::Int(2), Value::Number(20.0));
        table.set(TableKey::Int(3), Value::Number(30.0));
        assert_eq!(table.array.len(), 3);
        assert!(table.map.is_empty());
        assert_eq!(table.get(&TableKey::Int(2)), Value::Number(20.0));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn sparse_and_non_int_keys_use_the_hash_part() {
        let mut table = ObjectTable::new();
        table.set(TableKey::Int(100), Value::Bool(true));
        table.set(TableKey::Bool(false), Value::Number(1.0));
        assert!(table.array.is_empty());
        assert_eq!(table.get(&TableKey::Int(100)), Value::Bool(true));
        assert_eq!(table.get(&TableKey::Bool(false)), Value::Number(1.0));
        assert_eq!(table.get(&TableKey::Int(5)), Value::Nil);
    }

    #[test]
    fn nil_assignment_removes_hash_entries() {
        let mut table = ObjectTable::new();
        table.set(TableKey::Int(7), Value::Number(1.0));
        table.set(TableKey::Int(7), Value::Nil);
        assert!(table.map.is_empty());
        assert_eq!(table.get(&TableKey::Int(7)), Value::Nil);
    }
}
