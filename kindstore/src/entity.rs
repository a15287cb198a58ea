//! Conversion between application types and property lists.
//!
//! [`KvEntity`] is what the client saves and loads; `#[derive(KvEntity)]`
//! implements it field by field through [`ToValue`] and [`FromValue`].
//! Implementing those two traits for an application type (a typed id, a
//! custom timestamp) is how that type becomes storable, and how query filters
//! written with it are translated before they reach a backend.

use std::time::SystemTime;

use crate::property::truncate_time;
use crate::{Blob, Entity, Error, GeoPoint, Key, PropertyList, Value};

#[derive(Clone, Copy, Debug, Default)]
pub struct LoadOptions {
    /// Load what fits and report nothing for properties without a matching
    /// field.
    pub suppress_field_mismatch: bool,
}

pub trait KvEntity {
    fn save(&self) -> Result<PropertyList, Error>;

    fn load(&mut self, properties: PropertyList, options: &LoadOptions) -> Result<(), Error>;
}

/// Kind used by [`crate::Client::query_of`].
pub trait EntityKind {
    fn kind() -> &'static str;
}

pub trait ToValue {
    fn to_value(&self) -> Result<Value, Error>;
}

pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, Error>;
}

impl KvEntity for PropertyList {
    fn save(&self) -> Result<PropertyList, Error> {
        Ok(self.clone())
    }

    fn load(&mut self, properties: PropertyList, _options: &LoadOptions) -> Result<(), Error> {
        *self = properties;
        Ok(())
    }
}

impl KvEntity for Entity {
    fn save(&self) -> Result<PropertyList, Error> {
        Ok(self.properties.clone())
    }

    fn load(&mut self, properties: PropertyList, _options: &LoadOptions) -> Result<(), Error> {
        self.properties = properties;
        Ok(())
    }
}

fn mismatch(expected: &'static str, found: &Value) -> Error {
    Error::ValueMismatch {
        expected,
        found: found.type_name(),
    }
}

impl<T: ToValue + ?Sized> ToValue for &T {
    fn to_value(&self) -> Result<Value, Error> {
        (**self).to_value()
    }
}

impl ToValue for Value {
    fn to_value(&self) -> Result<Value, Error> {
        Ok(self.clone())
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, Error> {
        Ok(value)
    }
}

impl ToValue for bool {
    fn to_value(&self) -> Result<Value, Error> {
        Ok(Value::Bool(*self))
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, Error> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(mismatch("bool", &other)),
        }
    }
}

macro_rules! impl_int_value {
    ($($T:ty),+) => {
        $(
            impl ToValue for $T {
                fn to_value(&self) -> Result<Value, Error> {
                    i64::try_from(*self)
                        .map(Value::Int)
                        .map_err(|_| Error::InvalidProperty(format!("{} overflows int", self)))
                }
            }

            impl FromValue for $T {
                fn from_value(value: Value) -> Result<Self, Error> {
                    match value {
                        Value::Int(i) => <$T>::try_from(i).map_err(|_| Error::ValueMismatch {
                            expected: stringify!($T),
                            found: "out of range int",
                        }),
                        other => Err(mismatch(stringify!($T), &other)),
                    }
                }
            }
        )+
    };
}

impl_int_value!(i8, i16, i32, i64, u8, u16, u32, u64, usize);

impl ToValue for f64 {
    fn to_value(&self) -> Result<Value, Error> {
        Ok(Value::Float(*self))
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self, Error> {
        match value {
            Value::Float(f) => Ok(f),
            other => Err(mismatch("f64", &other)),
        }
    }
}

impl ToValue for f32 {
    fn to_value(&self) -> Result<Value, Error> {
        Ok(Value::Float(*self as f64))
    }
}

impl FromValue for f32 {
    fn from_value(value: Value) -> Result<Self, Error> {
        f64::from_value(value).map(|f| f as f32)
    }
}

impl ToValue for str {
    fn to_value(&self) -> Result<Value, Error> {
        Ok(Value::String(self.to_string()))
    }
}

impl ToValue for String {
    fn to_value(&self) -> Result<Value, Error> {
        Ok(Value::String(self.clone()))
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, Error> {
        match value {
            Value::String(s) => Ok(s),
            other => Err(mismatch("string", &other)),
        }
    }
}

impl ToValue for Blob {
    fn to_value(&self) -> Result<Value, Error> {
        Ok(Value::Bytes(self.0.clone()))
    }
}

impl FromValue for Blob {
    fn from_value(value: Value) -> Result<Self, Error> {
        match value {
            Value::Bytes(b) => Ok(Blob(b)),
            other => Err(mismatch("bytes", &other)),
        }
    }
}

impl ToValue for SystemTime {
    fn to_value(&self) -> Result<Value, Error> {
        Ok(Value::Time(truncate_time(*self)))
    }
}

impl FromValue for SystemTime {
    fn from_value(value: Value) -> Result<Self, Error> {
        match value {
            Value::Time(t) => Ok(t),
            other => Err(mismatch("time", &other)),
        }
    }
}

impl ToValue for GeoPoint {
    fn to_value(&self) -> Result<Value, Error> {
        Ok(Value::GeoPoint(*self))
    }
}

impl FromValue for GeoPoint {
    fn from_value(value: Value) -> Result<Self, Error> {
        match value {
            Value::GeoPoint(g) => Ok(g),
            other => Err(mismatch("geopoint", &other)),
        }
    }
}

impl ToValue for Key {
    fn to_value(&self) -> Result<Value, Error> {
        Ok(Value::Key(self.clone()))
    }
}

impl FromValue for Key {
    fn from_value(value: Value) -> Result<Self, Error> {
        match value {
            Value::Key(k) => Ok(k),
            other => Err(mismatch("key", &other)),
        }
    }
}

impl ToValue for Entity {
    fn to_value(&self) -> Result<Value, Error> {
        Ok(Value::Entity(Box::new(self.clone())))
    }
}

impl FromValue for Entity {
    fn from_value(value: Value) -> Result<Self, Error> {
        match value {
            Value::Entity(e) => Ok(*e),
            _ => Err(Error::InvalidEntityType),
        }
    }
}

impl<T: ToValue> ToValue for Option<T> {
    fn to_value(&self) -> Result<Value, Error> {
        match self {
            Some(v) => v.to_value(),
            None => Ok(Value::Null),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, Error> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: ToValue> ToValue for Vec<T> {
    fn to_value(&self) -> Result<Value, Error> {
        self.iter()
            .map(ToValue::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List)
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self, Error> {
        match value {
            Value::List(values) => values.into_iter().map(T::from_value).collect(),
            Value::Null => Ok(Vec::new()),
            other => Err(mismatch("list", &other)),
        }
    }
}

/// Saves a nested entity for `#[kv(entity)]` fields.
pub fn save_nested<T: KvEntity>(value: &T) -> Result<Value, Error> {
    Ok(Value::Entity(Box::new(Entity::new(None, value.save()?))))
}

/// Loads a nested entity for `#[kv(entity)]` fields. A null value leaves the
/// field untouched.
pub fn load_nested<T: KvEntity>(
    target: &mut T,
    value: Value,
    options: &LoadOptions,
) -> Result<(), Error> {
    match value {
        Value::Entity(entity) => target.load(entity.properties, options),
        Value::Null => Ok(()),
        _ => Err(Error::InvalidEntityType),
    }
}

pub(crate) fn save_all<T: KvEntity>(src: &[T]) -> Result<Vec<PropertyList>, Error> {
    src.iter()
        .map(|s| {
            let properties = s.save()?;
            properties.validate()?;
            Ok(properties)
        })
        .collect()
}
