// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The dynamic object model.
//!
//! Every value exchanged over ORPC is an [`Object`]: a cheap,
//! reference-counted handle over a tagged [`Value`]. Containers use
//! interior mutability so the same handle can be appended to from the
//! producer side while a consumer still holds it; the reference count
//! is the `Arc` strong count and is observable through
//! [`Object::refcount`].
//!
//! # Example
//!
//! ```
//! use orpc::object::Object;
//!
//! let arr = Object::array();
//! arr.append(Object::from(1i64)).unwrap();
//! arr.append(Object::from("two")).unwrap();
//! assert_eq!(arr.len(), 2);
//! let two = arr.get(1).unwrap();
//! assert_eq!(two.as_str(), Some("two"));
//! ```

mod error;

pub use error::ErrorObject;

use crate::error::{Error, Result};
use crate::typing::TypeInstance;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Object kind tags, one per [`Value`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Null,
    Bool,
    Uint64,
    Int64,
    Double,
    Date,
    String,
    Binary,
    Fd,
    Array,
    Dictionary,
    Error,
}

impl Kind {
    /// Builtin type name for this kind, as used by the typing layer.
    pub fn name(self) -> &'static str {
        match self {
            Self::Null => "nulltype",
            Self::Bool => "bool",
            Self::Uint64 => "uint64",
            Self::Int64 => "int64",
            Self::Double => "double",
            Self::Date => "date",
            Self::String => "string",
            Self::Binary => "binary",
            Self::Fd => "fd",
            Self::Array => "array",
            Self::Dictionary => "dictionary",
            Self::Error => "error",
        }
    }
}

/// Byte buffer payload: owned, or borrowed from static storage.
///
/// The borrow flavour exists so embedded blobs (compiled-in IDL,
/// fixtures) can cross the object layer without a copy.
#[derive(Clone)]
pub enum Binary {
    Owned(Vec<u8>),
    Static(&'static [u8]),
}

impl Binary {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Owned(v) => v,
            Self::Static(s) => s,
        }
    }
}

impl PartialEq for Binary {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl fmt::Debug for Binary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Binary({} bytes)", self.as_slice().len())
    }
}

/// Owned file descriptor. Closed when the last object handle drops.
#[derive(Debug)]
pub struct FdHandle {
    fd: RawFd,
}

impl FdHandle {
    pub fn raw(&self) -> RawFd {
        self.fd
    }

    /// Duplicate the descriptor (used by `Object::copy`).
    fn dup(&self) -> Result<Self> {
        let fd = unsafe { libc::dup(self.fd) };
        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(Self { fd })
    }
}

impl Drop for FdHandle {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

/// The tagged value an [`Object`] carries.
#[derive(Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Uint64(u64),
    Int64(i64),
    Double(f64),
    /// Seconds since the Unix epoch, whole-second precision.
    Date(i64),
    String(String),
    Binary(Binary),
    Fd(FdHandle),
    Array(Mutex<Vec<Object>>),
    Dictionary(Mutex<HashMap<String, Object>>),
    Error(ErrorObject),
}

struct ObjectData {
    value: Value,
    /// Type annotation set by the typed serializer; absent on plain
    /// objects.
    typei: RwLock<Option<Arc<TypeInstance>>>,
}

/// A reference-counted dynamic value.
///
/// Cloning retains, dropping releases. Equality is structural.
#[derive(Clone)]
pub struct Object {
    data: Arc<ObjectData>,
}

impl Object {
    fn from_value(value: Value) -> Self {
        Self {
            data: Arc::new(ObjectData {
                value,
                typei: RwLock::new(None),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    pub fn null() -> Self {
        Self::from_value(Value::Null)
    }

    pub fn boolean(v: bool) -> Self {
        Self::from_value(Value::Bool(v))
    }

    pub fn uint64(v: u64) -> Self {
        Self::from_value(Value::Uint64(v))
    }

    pub fn int64(v: i64) -> Self {
        Self::from_value(Value::Int64(v))
    }

    pub fn double(v: f64) -> Self {
        Self::from_value(Value::Double(v))
    }

    /// Date from seconds since the Unix epoch.
    pub fn date(secs: i64) -> Self {
        Self::from_value(Value::Date(secs))
    }

    pub fn string(v: impl Into<String>) -> Self {
        Self::from_value(Value::String(v.into()))
    }

    pub fn binary(v: Vec<u8>) -> Self {
        Self::from_value(Value::Binary(Binary::Owned(v)))
    }

    /// Binary borrowing static storage (no copy).
    pub fn binary_static(v: &'static [u8]) -> Self {
        Self::from_value(Value::Binary(Binary::Static(v)))
    }

    /// Take ownership of a file descriptor; it is closed when the last
    /// handle drops.
    pub fn fd(fd: RawFd) -> Self {
        Self::from_value(Value::Fd(FdHandle { fd }))
    }

    /// Empty array.
    pub fn array() -> Self {
        Self::from_value(Value::Array(Mutex::new(Vec::new())))
    }

    /// Array from existing elements.
    pub fn array_from(items: impl IntoIterator<Item = Object>) -> Self {
        Self::from_value(Value::Array(Mutex::new(items.into_iter().collect())))
    }

    /// Empty dictionary.
    pub fn dictionary() -> Self {
        Self::from_value(Value::Dictionary(Mutex::new(HashMap::new())))
    }

    /// Dictionary from existing entries.
    pub fn dictionary_from(entries: impl IntoIterator<Item = (String, Object)>) -> Self {
        Self::from_value(Value::Dictionary(Mutex::new(entries.into_iter().collect())))
    }

    pub fn error(err: ErrorObject) -> Self {
        Self::from_value(Value::Error(err))
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn kind(&self) -> Kind {
        match &self.data.value {
            Value::Null => Kind::Null,
            Value::Bool(_) => Kind::Bool,
            Value::Uint64(_) => Kind::Uint64,
            Value::Int64(_) => Kind::Int64,
            Value::Double(_) => Kind::Double,
            Value::Date(_) => Kind::Date,
            Value::String(_) => Kind::String,
            Value::Binary(_) => Kind::Binary,
            Value::Fd(_) => Kind::Fd,
            Value::Array(_) => Kind::Array,
            Value::Dictionary(_) => Kind::Dictionary,
            Value::Error(_) => Kind::Error,
        }
    }

    /// Current reference count (`Arc` strong count).
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    /// Handle identity: do both objects share storage?
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.data.value, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match &self.data.value {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match &self.data.value {
            Value::Uint64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match &self.data.value {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer value regardless of signedness tag, when it fits `i64`.
    pub fn as_integer(&self) -> Option<i64> {
        match &self.data.value {
            Value::Int64(v) => Some(*v),
            Value::Uint64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match &self.data.value {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Epoch seconds for date objects.
    pub fn as_date(&self) -> Option<i64> {
        match &self.data.value {
            Value::Date(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.data.value {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.data.value {
            Value::Binary(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    pub fn as_fd(&self) -> Option<RawFd> {
        match &self.data.value {
            Value::Fd(h) => Some(h.raw()),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorObject> {
        match &self.data.value {
            Value::Error(e) => Some(e),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Array operations
    // ------------------------------------------------------------------

    /// Append a retained element. Errors with EINVAL on non-arrays.
    pub fn append(&self, item: Object) -> Result<()> {
        match &self.data.value {
            Value::Array(items) => {
                items.lock().push(item);
                Ok(())
            }
            _ => Err(Error::Invalid(format!(
                "append on {} object",
                self.kind().name()
            ))),
        }
    }

    /// Replace the element at `index`. ERANGE when out of bounds.
    pub fn set(&self, index: usize, item: Object) -> Result<()> {
        match &self.data.value {
            Value::Array(items) => {
                let mut items = items.lock();
                if index >= items.len() {
                    return Err(Error::OutOfRange(format!(
                        "index {} past array length {}",
                        index,
                        items.len()
                    )));
                }
                items[index] = item;
                Ok(())
            }
            _ => Err(Error::Invalid(format!(
                "set on {} object",
                self.kind().name()
            ))),
        }
    }

    /// Retained element at `index`, if present.
    pub fn get(&self, index: usize) -> Option<Object> {
        match &self.data.value {
            Value::Array(items) => items.lock().get(index).cloned(),
            _ => None,
        }
    }

    /// Remove and return the element at `index`. ERANGE when out of
    /// bounds.
    pub fn remove(&self, index: usize) -> Result<Object> {
        match &self.data.value {
            Value::Array(items) => {
                let mut items = items.lock();
                if index >= items.len() {
                    return Err(Error::OutOfRange(format!(
                        "index {} past array length {}",
                        index,
                        items.len()
                    )));
                }
                Ok(items.remove(index))
            }
            _ => Err(Error::Invalid(format!(
                "remove on {} object",
                self.kind().name()
            ))),
        }
    }

    /// Element or entry count; 0 for non-containers.
    pub fn len(&self) -> usize {
        match &self.data.value {
            Value::Array(items) => items.lock().len(),
            Value::Dictionary(entries) => entries.lock().len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate array elements. Each element is handed to the callback
    /// as a retained handle; iteration runs over a snapshot so the
    /// callback may mutate the array. Stops early on
    /// `ControlFlow::Break`.
    pub fn apply(&self, mut cb: impl FnMut(usize, &Object) -> ControlFlow<()>) {
        let snapshot: Vec<Object> = match &self.data.value {
            Value::Array(items) => items.lock().clone(),
            _ => return,
        };
        for (i, item) in snapshot.iter().enumerate() {
            if cb(i, item).is_break() {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Dictionary operations
    // ------------------------------------------------------------------

    /// Insert or replace an entry. Returns false on non-dictionaries.
    pub fn dict_set(&self, key: impl Into<String>, value: Object) -> bool {
        match &self.data.value {
            Value::Dictionary(entries) => {
                entries.lock().insert(key.into(), value);
                true
            }
            _ => false,
        }
    }

    /// Retained value for `key`, if present.
    pub fn dict_get(&self, key: &str) -> Option<Object> {
        match &self.data.value {
            Value::Dictionary(entries) => entries.lock().get(key).cloned(),
            _ => None,
        }
    }

    /// Remove and return the value for `key`.
    pub fn dict_remove(&self, key: &str) -> Option<Object> {
        match &self.data.value {
            Value::Dictionary(entries) => entries.lock().remove(key),
            _ => None,
        }
    }

    /// Iterate dictionary entries over a snapshot, stopping early on
    /// `ControlFlow::Break`.
    pub fn dict_apply(&self, mut cb: impl FnMut(&str, &Object) -> ControlFlow<()>) {
        let snapshot: Vec<(String, Object)> = match &self.data.value {
            Value::Dictionary(entries) => entries
                .lock()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            _ => return,
        };
        for (key, value) in &snapshot {
            if cb(key, value).is_break() {
                break;
            }
        }
    }

    /// Sorted key list; used where deterministic iteration matters
    /// (diagnostics, typed serialization).
    pub fn dict_keys(&self) -> Vec<String> {
        match &self.data.value {
            Value::Dictionary(entries) => {
                let mut keys: Vec<String> = entries.lock().keys().cloned().collect();
                keys.sort();
                keys
            }
            _ => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Copy & annotation
    // ------------------------------------------------------------------

    /// Copy this object: containers become new containers re-retaining
    /// the same elements; leaves become fresh, semantically equal
    /// objects. File descriptors are `dup`ed.
    pub fn copy(&self) -> Result<Object> {
        let copied = match &self.data.value {
            Value::Null => Object::null(),
            Value::Bool(v) => Object::boolean(*v),
            Value::Uint64(v) => Object::uint64(*v),
            Value::Int64(v) => Object::int64(*v),
            Value::Double(v) => Object::double(*v),
            Value::Date(v) => Object::date(*v),
            Value::String(v) => Object::string(v.clone()),
            Value::Binary(b) => Object::from_value(Value::Binary(b.clone())),
            Value::Fd(h) => Object::from_value(Value::Fd(h.dup()?)),
            Value::Array(items) => Object::array_from(items.lock().iter().cloned()),
            Value::Dictionary(entries) => Object::dictionary_from(
                entries.lock().iter().map(|(k, v)| (k.clone(), v.clone())),
            ),
            Value::Error(e) => Object::error(e.clone()),
        };
        *copied.data.typei.write() = self.data.typei.read().clone();
        Ok(copied)
    }

    /// Type annotation set by the typed serializer.
    pub fn type_instance(&self) -> Option<Arc<TypeInstance>> {
        self.data.typei.read().clone()
    }

    /// Attach or clear the type annotation.
    pub fn set_type_instance(&self, typei: Option<Arc<TypeInstance>>) {
        *self.data.typei.write() = typei;
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        match (&self.data.value, &other.data.value) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Uint64(a), Value::Uint64(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::Fd(a), Value::Fd(b)) => a.raw() == b.raw(),
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                let a = a.lock().clone();
                let b = b.lock().clone();
                a == b
            }
            (Value::Dictionary(a), Value::Dictionary(b)) => {
                let a = a.lock().clone();
                let b = b.lock().clone();
                a == b
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data.value {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Uint64(v) => write!(f, "{}u", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Date(v) => write!(f, "date({})", v),
            Value::String(v) => write!(f, "{:?}", v),
            Value::Binary(b) => write!(f, "{:?}", b),
            Value::Fd(h) => write!(f, "fd({})", h.raw()),
            Value::Error(e) => write!(f, "error({})", e),
            Value::Array(items) => {
                let items = items.lock().clone();
                f.debug_list().entries(items.iter()).finish()
            }
            Value::Dictionary(entries) => {
                let entries = entries.lock().clone();
                f.debug_map().entries(entries.iter()).finish()
            }
        }
    }
}

// Conversion traits, one per leaf kind.
impl From<bool> for Object {
    fn from(v: bool) -> Self {
        Self::boolean(v)
    }
}

impl From<u32> for Object {
    fn from(v: u32) -> Self {
        Self::uint64(u64::from(v))
    }
}

impl From<u64> for Object {
    fn from(v: u64) -> Self {
        Self::uint64(v)
    }
}

impl From<i32> for Object {
    fn from(v: i32) -> Self {
        Self::int64(i64::from(v))
    }
}

impl From<i64> for Object {
    fn from(v: i64) -> Self {
        Self::int64(v)
    }
}

impl From<f64> for Object {
    fn from(v: f64) -> Self {
        Self::double(v)
    }
}

impl From<&str> for Object {
    fn from(v: &str) -> Self {
        Self::string(v)
    }
}

impl From<String> for Object {
    fn from(v: String) -> Self {
        Self::string(v)
    }
}

impl From<Vec<u8>> for Object {
    fn from(v: Vec<u8>) -> Self {
        Self::binary(v)
    }
}

impl From<ErrorObject> for Object {
    fn from(v: ErrorObject) -> Self {
        Self::error(v)
    }
}

impl<T: Into<Object>> From<Vec<T>> for Object {
    fn from(v: Vec<T>) -> Self {
        Self::array_from(v.into_iter().map(Into::into))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcount_balance() {
        let obj = Object::from("hello");
        assert_eq!(obj.refcount(), 1);
        {
            let retained = obj.clone();
            assert_eq!(obj.refcount(), 2);
            assert_eq!(retained.refcount(), 2);
        }
        assert_eq!(obj.refcount(), 1);
        assert_eq!(obj.as_str(), Some("hello"));
    }

    #[test]
    fn container_retains_elements() {
        let item = Object::from(7i64);
        let arr = Object::array();
        arr.append(item.clone()).unwrap();
        assert_eq!(item.refcount(), 2);
        arr.remove(0).unwrap();
        assert_eq!(item.refcount(), 1);
    }

    #[test]
    fn array_out_of_bounds_is_erange() {
        let arr = Object::array();
        let err = arr.set(0, Object::null()).unwrap_err();
        assert_eq!(err.code(), libc::ERANGE);
        let err = arr.remove(3).unwrap_err();
        assert_eq!(err.code(), libc::ERANGE);
    }

    #[test]
    fn append_to_leaf_is_einval() {
        let err = Object::from(1i64).append(Object::null()).unwrap_err();
        assert_eq!(err.code(), libc::EINVAL);
    }

    #[test]
    fn structural_equality() {
        let a = Object::array_from([Object::from(1i64), Object::from("x")]);
        let b = Object::array_from([Object::from(1i64), Object::from("x")]);
        assert_eq!(a, b);

        let d1 = Object::dictionary();
        d1.dict_set("k", Object::from(true));
        let d2 = Object::dictionary();
        d2.dict_set("k", Object::from(true));
        assert_eq!(d1, d2);
        d2.dict_set("extra", Object::null());
        assert_ne!(d1, d2);

        // Same value, different kind tag.
        assert_ne!(Object::uint64(5), Object::int64(5));
    }

    #[test]
    fn apply_stops_on_break() {
        let arr = Object::array_from((0..10i64).map(Object::from));
        let mut seen = 0;
        arr.apply(|_, _| {
            seen += 1;
            if seen == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(seen, 3);
    }

    #[test]
    fn apply_allows_mutation() {
        let arr = Object::array_from((0..3i64).map(Object::from));
        arr.apply(|_, _| {
            // Mutating during iteration must not deadlock.
            let _ = arr.append(Object::null());
            ControlFlow::Continue(())
        });
        assert_eq!(arr.len(), 6);
    }

    #[test]
    fn copy_reretains_container_elements() {
        let inner = Object::from("shared");
        let arr = Object::array_from([inner.clone()]);
        let copied = arr.copy().unwrap();
        assert!(!copied.ptr_eq(&arr));
        assert_eq!(copied, arr);
        // The element itself is shared, not copied.
        assert!(copied.get(0).unwrap().ptr_eq(&inner));
    }

    #[test]
    fn copy_leaf_is_fresh() {
        let s = Object::from("text");
        let copied = s.copy().unwrap();
        assert!(!copied.ptr_eq(&s));
        assert_eq!(copied, s);
    }

    #[test]
    fn date_boundaries() {
        assert_eq!(Object::date(0).as_date(), Some(0));
        assert_eq!(Object::date(i64::from(i32::MAX)).as_date(), Some(2_147_483_647));
    }

    #[test]
    fn binary_borrow_and_copy() {
        static BLOB: &[u8] = b"static-blob";
        let borrowed = Object::binary_static(BLOB);
        let owned = Object::binary(BLOB.to_vec());
        assert_eq!(borrowed, owned);
        assert_eq!(borrowed.as_bytes(), Some(BLOB));
    }

    #[test]
    fn dict_apply_sees_all_entries() {
        let dict = Object::dictionary();
        dict.dict_set("a", Object::from(1i64));
        dict.dict_set("b", Object::from(2i64));
        let mut keys = Vec::new();
        dict.dict_apply(|k, _| {
            keys.push(k.to_string());
            ControlFlow::Continue(())
        });
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn randomized_retain_release_balance() {
        let obj = Object::array_from([Object::from(1i64)]);
        let base = obj.refcount();
        let mut held = Vec::new();
        for _ in 0..200 {
            if fastrand::bool() {
                held.push(obj.clone());
            } else {
                held.pop();
            }
        }
        drop(held);
        assert_eq!(obj.refcount(), base);
        assert_eq!(obj.get(0).unwrap().as_i64(), Some(1));
    }
}
