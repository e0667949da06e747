use bytes::Bytes;
use serde_json::{Map, Value};

/// A JSON document addressed by dotted paths (`choices.0.delta.content`).
///
/// Numeric segments index into arrays when the value at that point is an array and
/// act as plain object keys otherwise. Fields that are never touched pass through
/// unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope(Value);

impl Envelope {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw).map(Self)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(&self.0).map(Bytes::from)
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.0.pointer(&to_pointer(path))
    }

    /// Returns the value at `path` unless it is missing or `null`.
    pub fn get_present(&self, path: &str) -> Option<&Value> {
        self.get(path).filter(|v| !v.is_null())
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(Value::as_bool)
    }

    /// Writes `value` at `path`, creating intermediate objects as needed. Anything
    /// that is in the way and is not a container gets replaced by an object.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) {
        let keys: Vec<&str> = segments(path).collect();
        let Some((last, parents)) = keys.split_last() else {
            self.0 = value.into();
            return;
        };
        let mut cursor = &mut self.0;
        for key in parents {
            cursor = child_or_insert(cursor, key);
        }
        *child_or_insert(cursor, last) = value.into();
    }

    /// Removes the value at `path` and returns it. Missing paths are a no-op.
    pub fn delete(&mut self, path: &str) -> Option<Value> {
        let keys: Vec<&str> = segments(path).collect();
        let (last, parents) = keys.split_last()?;
        let parent = self.0.pointer_mut(&pointer_of(parents))?;
        match parent {
            Value::Object(map) => map.remove(*last),
            Value::Array(items) => {
                let index = last.parse::<usize>().ok()?;
                (index < items.len()).then(|| items.remove(index))
            }
            _ => None,
        }
    }
}

impl From<Value> for Envelope {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

fn pointer_of(keys: &[&str]) -> String {
    let mut pointer = String::new();
    for key in keys {
        pointer.push('/');
        pointer.push_str(&key.replace('~', "~0").replace('/', "~1"));
    }
    pointer
}

fn to_pointer(path: &str) -> String {
    let keys: Vec<&str> = segments(path).collect();
    pointer_of(&keys)
}

fn child_or_insert<'a>(cursor: &'a mut Value, key: &str) -> &'a mut Value {
    let array_index = match cursor {
        Value::Array(items) => key.parse::<usize>().ok().filter(|i| *i < items.len()),
        _ => None,
    };
    if let Some(index) = array_index {
        return &mut cursor[index];
    }
    if !cursor.is_object() {
        *cursor = Value::Object(Map::new());
    }
    &mut cursor[key]
}
