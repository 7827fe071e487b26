//! Values crossing the host/guest boundary.
//!
//! Host objects the runtime does not understand (players, worlds, stores,
//! command buffers, events) travel as opaque [`Handle`]s. Guest-produced
//! data is snapshotted into plain [`HostValue`] trees; nothing here holds a
//! reference into a guest context, so values outlive any reload.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Opaque reference to a host object.
///
/// In guest code a handle is `{ __handle: kind, id }`; passing that object
/// back into the bridge yields the same handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    /// Host-defined type tag, e.g. `"playerRef"` or `"world"`.
    pub kind: String,
    /// Host-defined identity within `kind`.
    pub id: u64,
}

impl Handle {
    /// Create a handle.
    pub fn new(kind: impl Into<String>, id: u64) -> Self {
        Self {
            kind: kind.into(),
            id,
        }
    }
}

/// A value exchanged with guest code.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum HostValue {
    /// `null` / `undefined`, and anything not representable (functions, symbols).
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Integral number.
    Int(i64),
    /// Non-integral number.
    Float(f64),
    /// String.
    String(String),
    /// Array.
    List(Vec<HostValue>),
    /// Plain object.
    Map(BTreeMap<String, HostValue>),
    /// Opaque host object.
    Handle(Handle),
    /// Custom component instance; guest code sees it as a live object.
    Record(Arc<FieldRecord>),
}

impl HostValue {
    /// Build a map from pairs.
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, HostValue)>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Shorthand for a handle value.
    pub fn handle(kind: impl Into<String>, id: u64) -> Self {
        Self::Handle(Handle::new(kind, id))
    }

    /// Whether this is [`HostValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Boolean value; anything else is `None`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric value as `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Numeric value as `i64`, truncating floats.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.is_finite() => Some(f.trunc() as i64),
            _ => None,
        }
    }

    /// String value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Handle value.
    pub fn as_handle(&self) -> Option<&Handle> {
        match self {
            Self::Handle(h) => Some(h),
            _ => None,
        }
    }

    /// Field of a map value.
    pub fn get(&self, key: &str) -> Option<&HostValue> {
        match self {
            Self::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Take a map value apart; other variants yield an empty map.
    pub fn into_map(self) -> BTreeMap<String, HostValue> {
        match self {
            Self::Map(map) => map,
            _ => BTreeMap::new(),
        }
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for HostValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Handle> for HostValue {
    fn from(value: Handle) -> Self {
        Self::Handle(value)
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<HostValue>> From<Vec<T>> for HostValue {
    fn from(value: Vec<T>) -> Self {
        Self::List(value.into_iter().map(Into::into).collect())
    }
}

/// Key/value access to an object whose fields are not known statically.
pub trait FieldAccess {
    /// Read a field.
    fn get(&self, key: &str) -> Option<HostValue>;
    /// Write a field.
    fn set(&self, key: &str, value: HostValue);
    /// Whether a field exists.
    fn has(&self, key: &str) -> bool;
    /// Field names.
    fn keys(&self) -> Vec<String>;
}

static NEXT_RECORD_ID: AtomicU64 = AtomicU64::new(1);

/// Data record backing one custom component instance.
///
/// Shared between the host (which stores it on an entity) and any guest
/// views of it; writes through either side are visible to the other.
#[derive(Debug)]
pub struct FieldRecord {
    id: u64,
    fields: RwLock<BTreeMap<String, HostValue>>,
}

impl FieldRecord {
    /// Create a record from initial fields.
    pub fn new(fields: BTreeMap<String, HostValue>) -> Self {
        Self {
            id: NEXT_RECORD_ID.fetch_add(1, Ordering::Relaxed),
            fields: RwLock::new(fields),
        }
    }

    /// Process-unique identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Copy of the current fields.
    pub fn snapshot(&self) -> BTreeMap<String, HostValue> {
        self.fields.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Shallow copy into a new, independent record.
    pub fn clone_record(&self) -> Self {
        Self::new(self.snapshot())
    }

    /// Copy suitable for persistence. Records hold only plain data, so this
    /// is the same shallow copy as [`clone_record`](Self::clone_record).
    pub fn clone_serializable(&self) -> Self {
        self.clone_record()
    }
}

impl FieldAccess for FieldRecord {
    fn get(&self, key: &str) -> Option<HostValue> {
        self.fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: HostValue) {
        self.fields
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
    }

    fn has(&self, key: &str) -> bool {
        self.fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    fn keys(&self) -> Vec<String> {
        self.fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

impl PartialEq for FieldRecord {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other) || self.snapshot() == other.snapshot()
    }
}
