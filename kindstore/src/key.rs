use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::{Error, codec};

/// Hierarchical entity identifier.
///
/// A key names its kind, then either a numeric id, a string name, or
/// neither (an incomplete key the backend completes on write). Keys are
/// scoped by namespace and may have a parent, forming an ancestor path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    kind: String,
    id: i64,
    name: String,
    namespace: String,
    parent: Option<Arc<Key>>,
}

impl Key {
    pub fn incomplete(kind: impl Into<String>, parent: Option<&Key>) -> Self {
        Self::build(kind.into(), 0, String::new(), parent)
    }

    pub fn with_id(kind: impl Into<String>, id: i64, parent: Option<&Key>) -> Self {
        Self::build(kind.into(), id, String::new(), parent)
    }

    pub fn with_name(kind: impl Into<String>, name: impl Into<String>, parent: Option<&Key>) -> Self {
        Self::build(kind.into(), 0, name.into(), parent)
    }

    fn build(kind: String, id: i64, name: String, parent: Option<&Key>) -> Self {
        Key {
            kind,
            id,
            name,
            namespace: parent.map(|p| p.namespace.clone()).unwrap_or_default(),
            parent: parent.map(|p| Arc::new(p.clone())),
        }
    }

    /// Returns a copy of this key with every element of the ancestor path
    /// moved into `namespace`.
    pub fn in_namespace(&self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Key {
            kind: self.kind.clone(),
            id: self.id,
            name: self.name.clone(),
            parent: self
                .parent
                .as_ref()
                .map(|p| Arc::new(p.in_namespace(namespace.clone()))),
            namespace,
        }
    }

    /// Returns a copy with the given id, keeping kind, namespace and parent.
    pub fn completed(&self, id: i64) -> Self {
        Key {
            id,
            name: String::new(),
            ..self.clone()
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn parent(&self) -> Option<&Key> {
        self.parent.as_deref()
    }

    pub fn is_incomplete(&self) -> bool {
        self.id == 0 && self.name.is_empty()
    }

    /// True when `ancestor` equals this key or one of its parents.
    pub fn has_ancestor(&self, ancestor: &Key) -> bool {
        let mut current = Some(self);
        while let Some(key) = current {
            if key == ancestor {
                return true;
            }
            current = key.parent();
        }
        false
    }

    /// The ancestor path, root first.
    pub fn path(&self) -> Vec<&Key> {
        let mut path = Vec::new();
        let mut current = Some(self);
        while let Some(key) = current {
            path.push(key);
            current = key.parent();
        }
        path.reverse();
        path
    }

    pub fn root(&self) -> &Key {
        let mut current = self;
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.kind.is_empty() {
            return Err(Error::InvalidKey("empty kind".to_string()));
        }
        if self.id < 0 {
            return Err(Error::InvalidKey(format!("negative id {}", self.id)));
        }
        if self.id != 0 && !self.name.is_empty() {
            return Err(Error::InvalidKey(format!(
                "{} has both an id and a name",
                self
            )));
        }
        if let Some(parent) = self.parent() {
            if parent.is_incomplete() {
                return Err(Error::InvalidKey(format!("{} has an incomplete parent", self)));
            }
            if parent.namespace != self.namespace {
                return Err(Error::InvalidKey(format!(
                    "{} and its parent are in different namespaces",
                    self
                )));
            }
            parent.validate()?;
        }
        Ok(())
    }

    /// Like [`Key::validate`], and additionally rejects incomplete keys.
    pub fn validate_complete(&self) -> Result<(), Error> {
        self.validate()?;
        if self.is_incomplete() {
            return Err(Error::InvalidKey(format!("{} is incomplete", self)));
        }
        Ok(())
    }

    /// Opaque, URL-safe encoding. See [`Key::decode`].
    pub fn encode(&self) -> String {
        codec::encode_key(self)
    }

    pub fn decode(encoded: &str) -> Result<Self, Error> {
        codec::decode_key(encoded)
    }

    fn compare_element(&self, other: &Key) -> Ordering {
        self.kind.cmp(&other.kind).then_with(|| {
            match (self.name.is_empty(), other.name.is_empty()) {
                (true, true) => self.id.cmp(&other.id),
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => self.name.cmp(&other.name),
            }
        })
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.namespace.cmp(&other.namespace).then_with(|| {
            let (a, b) = (self.path(), other.path());
            for (x, y) in a.iter().zip(b.iter()) {
                match x.compare_element(y) {
                    Ordering::Equal => continue,
                    unequal => return unequal,
                }
            }
            a.len().cmp(&b.len())
        })
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(parent) = self.parent() {
            write!(f, "{}", parent)?;
        }
        if !self.name.is_empty() {
            write!(f, "/{},{:?}", self.kind, self.name)
        } else {
            write!(f, "/{},{}", self.kind, self.id)
        }
    }
}
