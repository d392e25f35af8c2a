//! Attribute storage on top of native typed attributes.
//!
//! Every path has two attribute stores: native typed attributes for primitives and
//! homogeneous arrays or matrices of primitives, and a JSON document held as a string
//! attribute under [N5_JSON_ROOT_KEY] for everything else. Writes keep the two stores
//! disjoint; on read, native attributes shadow same-named document entries.
//!
//! # Strings that look like JSON
//!
//! A native string attribute whose text is a JSON object or array (e.g. `{     }`) cannot
//! be told apart from a structured value that was stored as text. [AttributeCodec::get]
//! returns such a string literally when the requested type accepts a string, but
//! [AttributeCodec::get_json] and [AttributeCodec::get_all] parse it first and only fall
//! back to the literal text when parsing fails. Round-tripping arbitrary strings through
//! the JSON views is therefore lossy.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::attribute_path::{self, Token};
use crate::block::{DataBuffer, deserialize_from};
use crate::container::{Container, NativeAttribute, NativeScalar, NativeType};

/// Attribute holding the JSON document of a path.
pub const N5_JSON_ROOT_KEY: &str = "N5_JSON_ROOT";

/// A value to be stored as an attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// Stored as a native typed attribute when the key allows it.
    Native(NativeAttribute),
    /// Stored in the JSON document; primitives are moved to native attributes.
    /// `null` removes the key.
    Json(Value),
}

impl AttributeValue {
    /// Serialize any value to its JSON form.
    pub fn json<T: serde::Serialize>(value: &T) -> crate::Result<Self> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    /// Whether this value deletes the key.
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Json(Value::Null))
    }

    /// JSON form of the value.
    pub fn to_json(&self) -> Value {
        match self {
            AttributeValue::Native(attr) => native_to_json(attr, false),
            AttributeValue::Json(v) => v.clone(),
        }
    }

    /// Move JSON primitives to their native representation.
    fn into_storable(self) -> Self {
        let value = match self {
            AttributeValue::Json(value) => value,
            native => return native,
        };
        let scalar = match &value {
            Value::Bool(b) => NativeScalar::Bool(*b),
            Value::String(s) => NativeScalar::String(s.clone()),
            Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
                (Some(i), _, _) => NativeScalar::Int64(i),
                (None, Some(u), _) => NativeScalar::Uint64(u),
                (None, None, Some(f)) => NativeScalar::Float64(f),
                _ => return AttributeValue::Json(value),
            },
            _ => return AttributeValue::Json(value),
        };
        AttributeValue::Native(NativeAttribute::Scalar { value: scalar })
    }
}

macro_rules! impl_from_primitive {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for AttributeValue {
                fn from(value: $ty) -> Self {
                    AttributeValue::Native(NativeAttribute::Scalar {
                        value: NativeScalar::$variant(value),
                    })
                }
            }

            impl From<Vec<$ty>> for AttributeValue {
                fn from(value: Vec<$ty>) -> Self {
                    AttributeValue::Native(NativeAttribute::Array {
                        values: DataBuffer::$variant(value),
                    })
                }
            }

            impl From<Vec<Vec<$ty>>> for AttributeValue {
                fn from(rows: Vec<Vec<$ty>>) -> Self {
                    let cols = rows.first().map_or(0, Vec::len);
                    if rows.iter().any(|r| r.len() != cols) {
                        // ragged, not a matrix
                        return AttributeValue::Json(Value::Array(
                            rows.into_iter()
                                .map(|r| Value::Array(r.into_iter().map(Value::from).collect()))
                                .collect(),
                        ));
                    }
                    AttributeValue::Native(NativeAttribute::Matrix {
                        rows: rows.len(),
                        cols,
                        values: DataBuffer::$variant(rows.into_iter().flatten().collect()),
                    })
                }
            }
        )*
    };
}

impl_from_primitive!(
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => Uint8,
    u16 => Uint16,
    u32 => Uint32,
    u64 => Uint64,
    f32 => Float32,
    f64 => Float64,
);

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Native(NativeAttribute::Scalar {
            value: NativeScalar::Bool(value),
        })
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Native(NativeAttribute::Scalar {
            value: NativeScalar::String(value),
        })
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        value.to_string().into()
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(value: Vec<String>) -> Self {
        AttributeValue::Native(NativeAttribute::Array {
            values: DataBuffer::String(value),
        })
    }
}

impl From<Vec<&str>> for AttributeValue {
    fn from(value: Vec<&str>) -> Self {
        value
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>()
            .into()
    }
}

impl From<Vec<bool>> for AttributeValue {
    fn from(value: Vec<bool>) -> Self {
        AttributeValue::Json(Value::Array(value.into_iter().map(Value::Bool).collect()))
    }
}

impl From<Value> for AttributeValue {
    fn from(value: Value) -> Self {
        AttributeValue::Json(value)
    }
}

impl From<NativeAttribute> for AttributeValue {
    fn from(value: NativeAttribute) -> Self {
        AttributeValue::Native(value)
    }
}

/// Inferred kind of a stored attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    Scalar(NativeType),
    Array(NativeType),
    Matrix(NativeType),
    /// A JSON object (or `null`).
    Object,
    /// A JSON array.
    ObjectArray,
}

impl AttributeKind {
    fn of_json(value: &Value) -> Self {
        match value {
            Value::Array(_) => AttributeKind::ObjectArray,
            Value::Object(_) | Value::Null => AttributeKind::Object,
            Value::Bool(_) => AttributeKind::Scalar(NativeType::Bool),
            Value::Number(n) if n.is_i64() || n.is_u64() => AttributeKind::Scalar(NativeType::Int64),
            Value::Number(_) => AttributeKind::Scalar(NativeType::Float64),
            Value::String(_) => AttributeKind::Scalar(NativeType::VarString),
        }
    }

    fn of_native(attr: &NativeAttribute) -> Self {
        match attr {
            NativeAttribute::Scalar {
                value: NativeScalar::String(s),
            } => match serde_json::from_str::<Value>(s) {
                Ok(Value::Array(_)) => AttributeKind::ObjectArray,
                Ok(Value::Object(_)) => AttributeKind::Object,
                _ => AttributeKind::Scalar(NativeType::VarString),
            },
            NativeAttribute::Scalar { value } => AttributeKind::Scalar(value.native_type()),
            NativeAttribute::Array { values } => AttributeKind::Array(values.native_type()),
            NativeAttribute::Matrix { values, .. } => AttributeKind::Matrix(values.native_type()),
        }
    }
}

/// Parse a string as a JSON object or array, or keep it as a string.
pub fn promote_string(s: &str) -> Value {
    if s.is_empty() {
        return Value::String(String::new());
    }
    match serde_json::from_str::<Value>(s) {
        Ok(v @ (Value::Object(_) | Value::Array(_))) => v,
        _ => Value::String(s.to_string()),
    }
}

fn scalar_to_json(scalar: &NativeScalar) -> Value {
    match scalar {
        NativeScalar::Bool(v) => Value::from(*v),
        NativeScalar::Int8(v) => Value::from(*v),
        NativeScalar::Int16(v) => Value::from(*v),
        NativeScalar::Int32(v) => Value::from(*v),
        NativeScalar::Int64(v) => Value::from(*v),
        NativeScalar::Uint8(v) => Value::from(*v),
        NativeScalar::Uint16(v) => Value::from(*v),
        NativeScalar::Uint32(v) => Value::from(*v),
        NativeScalar::Uint64(v) => Value::from(*v),
        NativeScalar::Float32(v) => Value::from(*v),
        NativeScalar::Float64(v) => Value::from(*v),
        NativeScalar::String(v) => Value::from(v.as_str()),
    }
}

/// JSON form of a native attribute. With `promote`, strings go through [promote_string].
pub fn native_to_json(attr: &NativeAttribute, promote: bool) -> Value {
    match attr {
        NativeAttribute::Scalar {
            value: NativeScalar::String(s),
        } if promote => promote_string(s),
        NativeAttribute::Scalar { value } => scalar_to_json(value),
        NativeAttribute::Array { values } => Value::Array(values.to_json_values()),
        NativeAttribute::Matrix { rows, cols, values } => {
            Value::Array(values.to_json_rows(*rows, *cols))
        }
    }
}

fn unsupported<T>(key: &str, e: impl std::fmt::Display) -> crate::Error {
    crate::Error::Unsupported(format!(
        "reading attribute {key} as {} is not yet supported: {e}",
        std::any::type_name::<T>()
    ))
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> crate::Result<T> {
    serde_json::from_value(value).map_err(|e| unsupported::<T>(key, e))
}

/// Deserialize a non-string native attribute directly; JSON has no NaN or infinity.
fn decode_native<T: DeserializeOwned>(key: &str, attr: &NativeAttribute) -> crate::Result<T> {
    let out = match attr {
        NativeAttribute::Scalar { value } => match value {
            NativeScalar::Bool(v) => deserialize_from(*v),
            NativeScalar::Int8(v) => deserialize_from(*v),
            NativeScalar::Int16(v) => deserialize_from(*v),
            NativeScalar::Int32(v) => deserialize_from(*v),
            NativeScalar::Int64(v) => deserialize_from(*v),
            NativeScalar::Uint8(v) => deserialize_from(*v),
            NativeScalar::Uint16(v) => deserialize_from(*v),
            NativeScalar::Uint32(v) => deserialize_from(*v),
            NativeScalar::Uint64(v) => deserialize_from(*v),
            NativeScalar::Float32(v) => deserialize_from(*v),
            NativeScalar::Float64(v) => deserialize_from(*v),
            NativeScalar::String(v) => deserialize_from(v.clone()),
        },
        NativeAttribute::Array { values } => values.deserialize_seq(),
        NativeAttribute::Matrix { rows, cols, values } => values.deserialize_rows(*rows, *cols),
    };
    out.map_err(|e| unsupported::<T>(key, e))
}

/// How an attribute key addresses the two stores.
#[derive(Debug, PartialEq)]
enum Key {
    /// The whole JSON document.
    Root,
    /// A top-level attribute name.
    Name(String),
    /// A path into the JSON document.
    Path(Vec<Token>),
}

impl Key {
    fn classify(key: &str) -> Self {
        if key == N5_JSON_ROOT_KEY {
            return Key::Root;
        }
        let mut tokens = attribute_path::parse(key);
        if tokens.is_empty() {
            return Key::Root;
        }
        if attribute_path::is_path(key) {
            return Key::Path(tokens);
        }
        match tokens.pop() {
            Some(Token::Key(name)) => Key::Name(name),
            _ => Key::Root,
        }
    }
}

/// Reads and writes the attributes of container nodes. Paths must be normalized.
#[derive(Debug)]
pub struct AttributeCodec<'a, C: Container + ?Sized> {
    container: &'a C,
}

impl<'a, C: Container + ?Sized> AttributeCodec<'a, C> {
    pub fn new(container: &'a C) -> Self {
        Self { container }
    }

    fn json_root(&self, path: &str) -> crate::Result<Option<Value>> {
        match self.container.get_attribute(path, N5_JSON_ROOT_KEY)? {
            None => Ok(None),
            Some(NativeAttribute::Scalar {
                value: NativeScalar::String(s),
            }) => Ok(Some(serde_json::from_str(&s)?)),
            Some(other) => Err(crate::Error::native(format!(
                "{N5_JSON_ROOT_KEY} of {path} is not a string but {:?}",
                other.native_type()
            ))),
        }
    }

    fn write_json_root(&self, path: &str, root: &Value) -> crate::Result<()> {
        self.container.set_attribute(
            path,
            N5_JSON_ROOT_KEY,
            &NativeAttribute::Scalar {
                value: NativeScalar::String(serde_json::to_string(root)?),
            },
        )
    }

    /// Base value of a path key: a native attribute if the first token names one,
    /// otherwise the JSON document.
    fn resolve_path(&self, path: &str, tokens: &[Token]) -> crate::Result<Option<Value>> {
        if let Some(Token::Key(first)) = tokens.first() {
            if let Some(attr) = self.container.get_attribute(path, first)? {
                let base = native_to_json(&attr, true);
                return Ok(attribute_path::get(&base, &tokens[1..]).cloned());
            }
        }
        Ok(self
            .json_root(path)?
            .and_then(|root| attribute_path::get(&root, tokens).cloned()))
    }

    /// Read an attribute as JSON.
    ///
    /// Native strings are parsed as JSON objects or arrays where possible.
    pub fn get_json(&self, path: &str, key: &str) -> crate::Result<Option<Value>> {
        if !self.container.exists(path)? {
            return Ok(None);
        }
        match Key::classify(key) {
            Key::Root => self.json_root(path),
            Key::Name(name) => match self.container.get_attribute(path, &name)? {
                Some(attr) => Ok(Some(native_to_json(&attr, true))),
                None => Ok(self
                    .json_root(path)?
                    .and_then(|root| root.get(&name).cloned())),
            },
            Key::Path(tokens) => self.resolve_path(path, &tokens),
        }
    }

    /// Read an attribute as `T`.
    ///
    /// A native string is returned as is when `T` accepts a string, and parsed as JSON
    /// otherwise. Numbers convert only when the value fits `T` exactly; other conversions
    /// fail with [crate::Error::Unsupported].
    pub fn get<T: DeserializeOwned>(&self, path: &str, key: &str) -> crate::Result<Option<T>> {
        if !self.container.exists(path)? {
            return Ok(None);
        }
        let value = match Key::classify(key) {
            Key::Root => self.json_root(path)?,
            Key::Name(name) => match self.container.get_attribute(path, &name)? {
                Some(NativeAttribute::Scalar {
                    value: NativeScalar::String(s),
                }) => {
                    if let Ok(literal) = serde_json::from_value::<T>(Value::String(s.clone())) {
                        return Ok(Some(literal));
                    }
                    Some(serde_json::from_str::<Value>(&s).map_err(|e| {
                        crate::Error::Unsupported(format!(
                            "reading attribute {key} as {} is not yet supported: {e}",
                            std::any::type_name::<T>()
                        ))
                    })?)
                }
                Some(attr) => return decode_native(key, &attr).map(Some),
                None => self
                    .json_root(path)?
                    .and_then(|root| root.get(&name).cloned()),
            },
            Key::Path(tokens) => self.resolve_path(path, &tokens)?,
        };
        value.map(|v| decode(key, v)).transpose()
    }

    /// Store an attribute. Fails with [crate::Error::NotFound] if `path` does not exist.
    pub fn set(&self, path: &str, key: &str, value: AttributeValue) -> crate::Result<()> {
        if !self.container.exists(path)? {
            return Err(crate::Error::not_found(path));
        }
        if value.is_null() {
            self.remove(path, key)?;
            return Ok(());
        }
        match Key::classify(key) {
            Key::Root => {
                for name in self.container.attribute_names(path)? {
                    self.container.delete_attribute(path, &name)?;
                }
                self.write_json_root(path, &value.to_json())
            }
            Key::Name(name) => {
                self.container.delete_attribute(path, &name)?;
                let mut root = self.json_root(path)?;
                let in_root = root
                    .as_mut()
                    .and_then(Value::as_object_mut)
                    .and_then(|m| m.remove(&name))
                    .is_some();
                match value.into_storable() {
                    AttributeValue::Native(attr) => {
                        if let (true, Some(root)) = (in_root, &root) {
                            self.store_root(path, root)?;
                        }
                        self.container.set_attribute(path, &name, &attr)
                    }
                    AttributeValue::Json(v) => {
                        let mut root = root.unwrap_or_else(|| Value::Object(Map::new()));
                        attribute_path::insert(&mut root, &[Token::Key(name)], v);
                        self.write_json_root(path, &root)
                    }
                }
            }
            Key::Path(tokens) => {
                let mut root = self
                    .json_root(path)?
                    .unwrap_or_else(|| Value::Object(Map::new()));
                // a native attribute under the first key moves into the document
                if let Some(Token::Key(first)) = tokens.first() {
                    if let Some(attr) = self.container.get_attribute(path, first)? {
                        attribute_path::insert(
                            &mut root,
                            &tokens[..1],
                            native_to_json(&attr, true),
                        );
                        self.container.delete_attribute(path, first)?;
                    }
                }
                attribute_path::insert(&mut root, &tokens, value.to_json());
                self.write_json_root(path, &root)
            }
        }
    }

    /// Remove an attribute from whichever store holds it. Returns whether anything was removed.
    pub fn remove(&self, path: &str, key: &str) -> crate::Result<bool> {
        if !self.container.exists(path)? {
            return Ok(false);
        }
        match Key::classify(key) {
            Key::Root => {
                let mut removed = false;
                for name in self.container.attribute_names(path)? {
                    removed |= self.container.delete_attribute(path, &name)?;
                }
                Ok(removed)
            }
            Key::Name(name) => {
                if self.container.delete_attribute(path, &name)? {
                    return Ok(true);
                }
                self.remove_from_root(path, &[Token::Key(name)])
            }
            Key::Path(tokens) => self.remove_from_root(path, &tokens),
        }
    }

    fn remove_from_root(&self, path: &str, tokens: &[Token]) -> crate::Result<bool> {
        let Some(mut root) = self.json_root(path)? else {
            return Ok(false);
        };
        if attribute_path::remove(&mut root, tokens).is_none() {
            return Ok(false);
        }
        self.store_root(path, &root)?;
        Ok(true)
    }

    /// Write the document back, dropping it once it is an empty object.
    fn store_root(&self, path: &str, root: &Value) -> crate::Result<()> {
        if root.as_object().is_some_and(Map::is_empty) {
            self.container.delete_attribute(path, N5_JSON_ROOT_KEY)?;
            Ok(())
        } else {
            self.write_json_root(path, root)
        }
    }

    /// Names and inferred kinds of all logical attributes of a path.
    pub fn list(&self, path: &str) -> crate::Result<BTreeMap<String, AttributeKind>> {
        if !self.container.exists(path)? {
            return Err(crate::Error::not_found(path));
        }
        let mut out = BTreeMap::new();
        match self.json_root(path)? {
            Some(Value::Object(map)) => {
                for (k, v) in &map {
                    out.insert(k.clone(), AttributeKind::of_json(v));
                }
            }
            Some(other) => {
                out.insert(N5_JSON_ROOT_KEY.to_string(), AttributeKind::of_json(&other));
            }
            None => {}
        }
        for name in self.container.attribute_names(path)? {
            if name == N5_JSON_ROOT_KEY {
                continue;
            }
            if let Some(attr) = self.container.get_attribute(path, &name)? {
                out.insert(name, AttributeKind::of_native(&attr));
            }
        }
        Ok(out)
    }

    /// All logical attributes of a path as one JSON map.
    ///
    /// Native strings are parsed as JSON objects or arrays where possible.
    pub fn get_all(&self, path: &str) -> crate::Result<Map<String, Value>> {
        if !self.container.exists(path)? {
            return Err(crate::Error::not_found(path));
        }
        let mut out = Map::new();
        match self.json_root(path)? {
            Some(Value::Object(map)) => out.extend(map),
            Some(other) => {
                out.insert(N5_JSON_ROOT_KEY.to_string(), other);
            }
            None => {}
        }
        for name in self.container.attribute_names(path)? {
            if name == N5_JSON_ROOT_KEY {
                continue;
            }
            if let Some(attr) = self.container.get_attribute(path, &name)? {
                out.insert(name, native_to_json(&attr, true));
            }
        }
        Ok(out)
    }
}
