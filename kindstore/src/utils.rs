use tikv_client::Key as RawKey;

use crate::codec::to_hex;
use crate::{Error, Key};

/// Smallest raw key sorting after every path that starts with `key`.
/// Used as the exclusive upper bound when paging through an entity scan.
pub(crate) fn next_key(key: &RawKey) -> RawKey {
    let mut next_key = Into::<Vec<u8>>::into(key.clone());
    for i in (0..next_key.len()).rev() {
        if next_key[i] < 0xff {
            next_key[i] += 1;
            return RawKey::from(next_key);
        }
    }
    RawKey::from(next_key)
}

pub(crate) fn namespace_prefix(namespace: &str) -> String {
    format!("entity/{}/", to_hex(namespace.as_bytes()))
}

pub(crate) fn kind_prefix(namespace: &str, kind: &str) -> String {
    format!("{}{}/", namespace_prefix(namespace), to_hex(kind.as_bytes()))
}

pub(crate) fn entity_path(key: &Key) -> String {
    format!("{}{}", kind_prefix(key.namespace(), key.kind()), key.encode())
}

pub(crate) fn sequence_path(namespace: &str, kind: &str) -> String {
    format!(
        "sequence/{}/{}",
        to_hex(namespace.as_bytes()),
        to_hex(kind.as_bytes())
    )
}

/// Range covering every path under `prefix`.
pub(crate) fn prefix_range(prefix: &str) -> (RawKey, RawKey) {
    (
        RawKey::from(prefix.to_string()),
        RawKey::from(format!("{}~", prefix)),
    )
}

/// Recovers the entity key from a path built by [`entity_path`].
pub(crate) fn key_from_path(path: &RawKey) -> Result<Key, Error> {
    let path = String::from_utf8(Into::<Vec<u8>>::into(path.clone()))
        .map_err(|e| Error::InvalidKey(e.to_string()))?;
    let Some(encoded) = path.split('/').nth(3) else {
        return Err(Error::InvalidKey(format!("not an entity path: {}", path)));
    };
    Key::decode(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_key_increments_last_byte() {
        assert_eq!(next_key(&RawKey::from(vec![1, 2])), RawKey::from(vec![1, 3]));
        assert_eq!(next_key(&RawKey::from(vec![1, 0xff])), RawKey::from(vec![2, 0xff]));
    }

    #[test]
    fn entity_paths_round_trip() {
        let parent = Key::with_name("Org", "acme", None);
        let key = Key::with_id("Data", 7, Some(&parent)).in_namespace("tenant");
        let path = entity_path(&key);
        assert!(path.starts_with(&kind_prefix("tenant", "Data")));
        assert!(path.starts_with(&namespace_prefix("tenant")));
        assert_eq!(key_from_path(&RawKey::from(path)).unwrap(), key);
    }

    #[test]
    fn prefix_range_contains_children() {
        let (start, end) = prefix_range(&kind_prefix("", "Data"));
        let child = RawKey::from(entity_path(&Key::with_id("Data", 1, None)));
        assert!(start <= child && child < end);
    }
}
