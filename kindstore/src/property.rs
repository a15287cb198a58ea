use std::ops::{Deref, DerefMut};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{Error, Key};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lng)
    }
}

/// A nested entity stored as a property value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Entity {
    pub key: Option<Key>,
    pub properties: PropertyList,
}

impl Entity {
    pub fn new(key: Option<Key>, properties: PropertyList) -> Self {
        Self { key, properties }
    }
}

/// Raw bytes. Kept apart from `Vec<u8>` so that `Vec<T>` always means a
/// list value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Blob(pub Vec<u8>);

#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Time(SystemTime),
    GeoPoint(GeoPoint),
    Key(Key),
    Entity(Box<Entity>),
    List(Vec<Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Time(_) => "time",
            Value::GeoPoint(_) => "geopoint",
            Value::Key(_) => "key",
            Value::Entity(_) => "entity",
            Value::List(_) => "list",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Drops sub-microsecond precision, which the store does not keep.
pub fn truncate_time(time: SystemTime) -> SystemTime {
    micros_to_time(time_to_micros(time))
}

pub(crate) fn time_to_micros(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros().min(i64::MAX as u128) as i64,
        Err(e) => {
            let before = e.duration();
            let micros = before.as_micros().min(i64::MAX as u128) as i64;
            // Round toward negative infinity so truncation stays monotonic.
            if before.subsec_nanos() % 1_000 != 0 {
                -micros - 1
            } else {
                -micros
            }
        }
    }
}

pub(crate) fn micros_to_time(micros: i64) -> SystemTime {
    if micros >= 0 {
        UNIX_EPOCH + Duration::from_micros(micros as u64)
    } else {
        UNIX_EPOCH - Duration::from_micros(micros.unsigned_abs())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Property {
    pub name: String,
    pub value: Value,
    pub no_index: bool,
}

impl Property {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            no_index: false,
        }
    }

    pub fn unindexed(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            no_index: true,
        }
    }

    /// Renames the property to `prefix.name`, as used by flattened
    /// sub-structs.
    pub fn prefixed(self, prefix: &str) -> Self {
        Self {
            name: format!("{}.{}", prefix, self.name),
            ..self
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropertyList(pub Vec<Property>);

impl PropertyList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    /// Resolves a dotted path, descending into nested entities when the
    /// flattened name is absent.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.get(path) {
            return Some(value);
        }
        let (head, rest) = path.split_once('.')?;
        match self.get(head)? {
            Value::Entity(entity) => entity.properties.lookup(rest),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        for property in self.0.iter() {
            validate_property_name(&property.name)?;
            if let Value::Entity(entity) = &property.value {
                entity.properties.validate()?;
            }
            if let Value::GeoPoint(point) = &property.value {
                if !point.is_valid() {
                    return Err(Error::InvalidProperty(format!(
                        "{}: geopoint out of range",
                        property.name
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Deref for PropertyList {
    type Target = Vec<Property>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PropertyList {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FromIterator<Property> for PropertyList {
    fn from_iter<I: IntoIterator<Item = Property>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for PropertyList {
    type Item = Property;
    type IntoIter = std::vec::IntoIter<Property>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<Vec<Property>> for PropertyList {
    fn from(properties: Vec<Property>) -> Self {
        Self(properties)
    }
}

/// Property names are dotted identifiers: every segment starts with a letter
/// or `_` and continues with letters, digits or `_`.
pub fn validate_property_name(name: &str) -> Result<(), Error> {
    let valid_segment = |segment: &str| {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_alphabetic() || c == '_' => {
                chars.all(|c| c.is_alphanumeric() || c == '_')
            }
            _ => false,
        }
    };
    if name.split('.').all(valid_segment) {
        Ok(())
    } else {
        Err(Error::InvalidProperty(format!("invalid name {:?}", name)))
    }
}
