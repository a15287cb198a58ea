//! Wire shapes for keys, cursors and property lists.
//!
//! Property lists are stored by the TiKV backend and by byte-oriented cache
//! stores in this encoding; keys and cursors are exposed to callers as hex
//! strings of their messages.

use prost::Message;

use crate::property::{micros_to_time, time_to_micros};
use crate::query::Cursor;
use crate::{Entity, Error, GeoPoint, Key, Property, PropertyList, Value};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PathElementProto {
    #[prost(string, tag = "1")]
    pub kind: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub id: i64,
    #[prost(string, tag = "3")]
    pub name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyProto {
    #[prost(string, tag = "1")]
    pub namespace: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub path: ::prost::alloc::vec::Vec<PathElementProto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GeoPointProto {
    #[prost(double, tag = "1")]
    pub lat: f64,
    #[prost(double, tag = "2")]
    pub lng: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EntityProto {
    #[prost(message, optional, tag = "1")]
    pub key: ::core::option::Option<KeyProto>,
    #[prost(message, repeated, tag = "2")]
    pub properties: ::prost::alloc::vec::Vec<PropertyProto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListProto {
    #[prost(message, repeated, tag = "1")]
    pub values: ::prost::alloc::vec::Vec<ValueProto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ValueProto {
    #[prost(oneof = "value_proto::Kind", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11")]
    pub kind: ::core::option::Option<value_proto::Kind>,
}

pub mod value_proto {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(bool, tag = "1")]
        Null(bool),
        #[prost(bool, tag = "2")]
        Bool(bool),
        #[prost(int64, tag = "3")]
        Int(i64),
        #[prost(double, tag = "4")]
        Float(f64),
        #[prost(string, tag = "5")]
        Str(::prost::alloc::string::String),
        #[prost(bytes = "vec", tag = "6")]
        Bytes(::prost::alloc::vec::Vec<u8>),
        #[prost(int64, tag = "7")]
        TimeMicros(i64),
        #[prost(message, tag = "8")]
        GeoPoint(super::GeoPointProto),
        #[prost(message, tag = "9")]
        Key(super::KeyProto),
        #[prost(message, tag = "10")]
        Entity(super::EntityProto),
        #[prost(message, tag = "11")]
        List(super::ListProto),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PropertyProto {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub value: ::core::option::Option<ValueProto>,
    #[prost(bool, tag = "3")]
    pub no_index: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PropertyListProto {
    #[prost(message, repeated, tag = "1")]
    pub properties: ::prost::alloc::vec::Vec<PropertyProto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CursorProto {
    #[prost(uint64, tag = "1")]
    pub position: u64,
}

pub fn key_to_proto(key: &Key) -> KeyProto {
    KeyProto {
        namespace: key.namespace().to_string(),
        path: key
            .path()
            .into_iter()
            .map(|k| PathElementProto {
                kind: k.kind().to_string(),
                id: k.id(),
                name: k.name().to_string(),
            })
            .collect(),
    }
}

pub fn key_from_proto(proto: KeyProto) -> Result<Key, Error> {
    let mut key: Option<Key> = None;
    for element in proto.path {
        let next = if element.name.is_empty() {
            Key::with_id(element.kind, element.id, key.as_ref())
        } else {
            Key::with_name(element.kind, element.name, key.as_ref())
        };
        key = Some(match key {
            Some(_) => next,
            None => next.in_namespace(proto.namespace.clone()),
        });
    }
    let key = key.ok_or_else(|| Error::InvalidKey("empty key path".to_string()))?;
    key.validate()?;
    Ok(key)
}

fn value_to_proto(value: &Value) -> ValueProto {
    use value_proto::Kind;
    let kind = match value {
        Value::Null => Kind::Null(true),
        Value::Bool(b) => Kind::Bool(*b),
        Value::Int(i) => Kind::Int(*i),
        Value::Float(f) => Kind::Float(*f),
        Value::String(s) => Kind::Str(s.clone()),
        Value::Bytes(b) => Kind::Bytes(b.clone()),
        Value::Time(t) => Kind::TimeMicros(time_to_micros(*t)),
        Value::GeoPoint(g) => Kind::GeoPoint(GeoPointProto {
            lat: g.lat,
            lng: g.lng,
        }),
        Value::Key(k) => Kind::Key(key_to_proto(k)),
        Value::Entity(e) => Kind::Entity(EntityProto {
            key: e.key.as_ref().map(key_to_proto),
            properties: properties_to_proto(&e.properties),
        }),
        Value::List(values) => Kind::List(ListProto {
            values: values.iter().map(value_to_proto).collect(),
        }),
    };
    ValueProto { kind: Some(kind) }
}

fn value_from_proto(proto: ValueProto) -> Result<Value, Error> {
    use value_proto::Kind;
    Ok(match proto.kind {
        None | Some(Kind::Null(_)) => Value::Null,
        Some(Kind::Bool(b)) => Value::Bool(b),
        Some(Kind::Int(i)) => Value::Int(i),
        Some(Kind::Float(f)) => Value::Float(f),
        Some(Kind::Str(s)) => Value::String(s),
        Some(Kind::Bytes(b)) => Value::Bytes(b),
        Some(Kind::TimeMicros(t)) => Value::Time(micros_to_time(t)),
        Some(Kind::GeoPoint(g)) => Value::GeoPoint(GeoPoint::new(g.lat, g.lng)),
        Some(Kind::Key(k)) => Value::Key(key_from_proto(k)?),
        Some(Kind::Entity(e)) => Value::Entity(Box::new(Entity {
            key: e.key.map(key_from_proto).transpose()?,
            properties: properties_from_proto(e.properties)?,
        })),
        Some(Kind::List(l)) => Value::List(
            l.values
                .into_iter()
                .map(value_from_proto)
                .collect::<Result<_, _>>()?,
        ),
    })
}

fn properties_to_proto(properties: &PropertyList) -> Vec<PropertyProto> {
    properties
        .iter()
        .map(|p| PropertyProto {
            name: p.name.clone(),
            value: Some(value_to_proto(&p.value)),
            no_index: p.no_index,
        })
        .collect()
}

fn properties_from_proto(properties: Vec<PropertyProto>) -> Result<PropertyList, Error> {
    properties
        .into_iter()
        .map(|p| {
            Ok(Property {
                name: p.name,
                value: p.value.map(value_from_proto).transpose()?.unwrap_or_default(),
                no_index: p.no_index,
            })
        })
        .collect()
}

pub fn encode_properties(properties: &PropertyList) -> Vec<u8> {
    PropertyListProto {
        properties: properties_to_proto(properties),
    }
    .encode_to_vec()
}

pub fn decode_properties(data: &[u8]) -> Result<PropertyList, Error> {
    let proto = PropertyListProto::decode(data).map_err(Error::DeserializationError)?;
    properties_from_proto(proto.properties)
}

pub fn encode_key(key: &Key) -> String {
    to_hex(&key_to_proto(key).encode_to_vec())
}

pub fn decode_key(encoded: &str) -> Result<Key, Error> {
    let bytes = from_hex(encoded).ok_or_else(|| Error::InvalidKey(format!("bad encoding {:?}", encoded)))?;
    key_from_proto(KeyProto::decode(bytes.as_slice()).map_err(Error::DeserializationError)?)
}

pub fn encode_cursor(cursor: &Cursor) -> String {
    to_hex(
        &CursorProto {
            position: cursor.position() as u64,
        }
        .encode_to_vec(),
    )
}

pub fn decode_cursor(encoded: &str) -> Result<Cursor, Error> {
    let bytes =
        from_hex(encoded).ok_or_else(|| Error::InvalidArgument(format!("bad cursor {:?}", encoded)))?;
    let proto = CursorProto::decode(bytes.as_slice()).map_err(Error::DeserializationError)?;
    Ok(Cursor::new(proto.position as usize))
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}

pub(crate) fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    let digit = |c: u8| match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    };
    s.as_bytes()
        .chunks(2)
        .map(|pair| Some(digit(pair[0])? << 4 | digit(pair[1])?))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    #[test]
    fn property_list_survives_encoding() {
        let parent = Key::with_name("Org", "acme", None);
        let nested: PropertyList = vec![Property::new("Street", Value::String("Main".into()))].into();
        let props: PropertyList = vec![
            Property::new("Null", Value::Null),
            Property::new("Bool", Value::Bool(true)),
            Property::new("Int", Value::Int(-7)),
            Property::new("Float", Value::Float(1.5)),
            Property::unindexed("Text", Value::String("hello".into())),
            Property::new("Bytes", Value::Bytes(vec![0, 1, 255])),
            Property::new("Time", Value::Time(UNIX_EPOCH + Duration::from_micros(1_234_567))),
            Property::new("Geo", Value::GeoPoint(GeoPoint::new(59.9, 10.7))),
            Property::new("Ref", Value::Key(Key::with_id("Data", 3, Some(&parent)))),
            Property::new(
                "Address",
                Value::Entity(Box::new(Entity::new(Some(parent.clone()), nested))),
            ),
            Property::new("Tags", Value::List(vec![Value::String("a".into()), Value::Int(2)])),
        ]
        .into();
        let decoded = decode_properties(&encode_properties(&props)).unwrap();
        assert_eq!(decoded, props);
    }

    #[test]
    fn hex() {
        assert_eq!(to_hex(&[0x00, 0xab, 0x10]), "00ab10");
        assert_eq!(from_hex("00AB10"), Some(vec![0x00, 0xab, 0x10]));
        assert_eq!(from_hex("abc"), None);
        assert_eq!(from_hex("zz"), None);
    }

    #[test]
    fn cursor_round_trip() {
        let cursor = Cursor::new(17);
        assert_eq!(decode_cursor(&encode_cursor(&cursor)).unwrap(), cursor);
    }
}
