//! In-process query evaluation shared by the bundled backends.

use std::cmp::Ordering;

use crate::query::{Direction, Filter, FilterOp};
use crate::{Error, Key, Property, PropertyList, QueryDump, Value};

/// Result of evaluating a query: the items after cursors, offset and limit,
/// and the result-set position of the first one.
pub struct Evaluated {
    pub items: Vec<(Key, PropertyList)>,
    pub first_position: usize,
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Int(_) => 1,
        Value::Time(_) => 2,
        Value::Bool(_) => 3,
        Value::String(_) | Value::Bytes(_) => 4,
        Value::Float(_) => 5,
        Value::GeoPoint(_) => 6,
        Value::Key(_) => 7,
        Value::Entity(_) => 8,
        Value::List(_) => 9,
    }
}

/// Total order over values: first by type, then within the type.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Time(x), Value::Time(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::String(x), Value::Bytes(y)) => x.as_bytes().cmp(y.as_slice()),
        (Value::Bytes(x), Value::String(y)) => x.as_slice().cmp(y.as_bytes()),
        (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
        (Value::Float(x), Value::Float(y)) => x.total_cmp(y),
        (Value::GeoPoint(x), Value::GeoPoint(y)) => {
            x.lat.total_cmp(&y.lat).then(x.lng.total_cmp(&y.lng))
        }
        (Value::Key(x), Value::Key(y)) => x.cmp(y),
        (Value::List(x), Value::List(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                match compare_values(l, r) {
                    Ordering::Equal => continue,
                    unequal => return unequal,
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn satisfies(value: &Value, filter: &Filter) -> bool {
    if let Value::List(values) = value {
        return values.iter().any(|v| satisfies(v, filter));
    }
    let ordering = compare_values(value, &filter.value);
    match filter.op {
        FilterOp::Eq => ordering == Ordering::Equal,
        FilterOp::Ne => ordering != Ordering::Equal,
        FilterOp::Lt => ordering == Ordering::Less,
        FilterOp::Le => ordering != Ordering::Greater,
        FilterOp::Gt => ordering == Ordering::Greater,
        FilterOp::Ge => ordering != Ordering::Less,
    }
}

/// Value used for sorting: list properties sort by their smallest element
/// ascending and their largest descending.
fn sort_value<'a>(value: &'a Value, direction: Direction) -> &'a Value {
    match value {
        Value::List(values) if !values.is_empty() => {
            let pick = values.iter().reduce(|best, v| {
                let ordering = compare_values(v, best);
                match direction {
                    Direction::Ascending if ordering == Ordering::Less => v,
                    Direction::Descending if ordering == Ordering::Greater => v,
                    _ => best,
                }
            });
            pick.unwrap_or(value)
        }
        _ => value,
    }
}

/// Whether an entity satisfies the query's namespace, kind, ancestor and
/// filters. `__key__` filters compare against the entity's key.
pub fn matches(dump: &QueryDump, key: &Key, properties: &PropertyList) -> bool {
    if key.namespace() != dump.namespace {
        return false;
    }
    if !dump.kind.is_empty() && key.kind() != dump.kind {
        return false;
    }
    if let Some(ancestor) = &dump.ancestor {
        if !key.has_ancestor(ancestor) {
            return false;
        }
    }
    let key_value = Value::Key(key.clone());
    dump.filters.iter().all(|filter| {
        let value = if filter.path == "__key__" {
            Some(&key_value)
        } else {
            properties.lookup(&filter.path)
        };
        value.is_some_and(|value| satisfies(value, filter))
    })
}

pub fn evaluate(
    dump: &QueryDump,
    entities: impl IntoIterator<Item = (Key, PropertyList)>,
) -> Result<Evaluated, Error> {
    let key_only_filters = dump.filters.iter().all(|f| f.path == "__key__");
    if dump.is_kindless() && (!key_only_filters || !dump.orders.is_empty()) {
        return Err(Error::InvalidQuery(
            "kindless queries can only filter on __key__ and cannot be ordered".to_string(),
        ));
    }

    let mut matched: Vec<(Key, PropertyList)> = entities
        .into_iter()
        .filter(|(key, properties)| matches(dump, key, properties))
        .filter(|(_, properties)| {
            dump.orders
                .iter()
                .all(|o| o.path == "__key__" || properties.lookup(&o.path).is_some())
        })
        .collect();

    matched.sort_by(|(ka, pa), (kb, pb)| {
        for order in dump.orders.iter() {
            let ordering = if order.path == "__key__" {
                ka.cmp(kb)
            } else {
                match (pa.lookup(&order.path), pb.lookup(&order.path)) {
                    (Some(a), Some(b)) => compare_values(
                        sort_value(a, order.direction),
                        sort_value(b, order.direction),
                    ),
                    _ => Ordering::Equal,
                }
            };
            let ordering = match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        ka.cmp(kb)
    });

    if !dump.distinct_on.is_empty() {
        let mut seen: Vec<Vec<Option<Value>>> = Vec::new();
        matched.retain(|(_, properties)| {
            let signature: Vec<Option<Value>> = dump
                .distinct_on
                .iter()
                .map(|path| properties.lookup(path).cloned())
                .collect();
            if seen.contains(&signature) {
                false
            } else {
                seen.push(signature);
                true
            }
        });
    }

    let end = dump
        .end_cursor
        .map(|c| c.position())
        .unwrap_or(matched.len())
        .min(matched.len());
    let start = dump.start_cursor.map(|c| c.position()).unwrap_or(0).min(end);
    let first_position = (start + dump.offset).min(end);

    let items = matched
        .into_iter()
        .take(end)
        .skip(first_position)
        .take(dump.limit.unwrap_or(usize::MAX))
        .map(|(key, properties)| {
            let properties = if dump.keys_only {
                PropertyList::new()
            } else if !dump.projection.is_empty() {
                dump.projection
                    .iter()
                    .filter_map(|path| {
                        properties
                            .lookup(path)
                            .map(|value| Property::new(path.clone(), value.clone()))
                    })
                    .collect()
            } else {
                properties
            };
            (key, properties)
        })
        .collect();

    Ok(Evaluated {
        items,
        first_position,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Cursor;
    use crate::{Query, ToValue};

    fn entity(id: i64, name: &str, tags: &[&str]) -> (Key, PropertyList) {
        let props: PropertyList = vec![
            Property::new("Name", Value::String(name.to_string())),
            Property::new("Tags", tags.iter().map(|t| t.to_string()).collect::<Vec<_>>().to_value().unwrap()),
        ]
        .into();
        (Key::with_id("Data", id, None), props)
    }

    fn data() -> Vec<(Key, PropertyList)> {
        vec![
            entity(1, "a", &["x"]),
            entity(2, "b", &["x", "y"]),
            entity(3, "c", &["z"]),
            (Key::with_id("Other", 1, None), PropertyList::new()),
        ]
    }

    fn keys(evaluated: &Evaluated) -> Vec<i64> {
        evaluated.items.iter().map(|(k, _)| k.id()).collect()
    }

    #[test]
    fn kind_filter_and_descending_order() {
        let q = Query::new("Data").order("-Name");
        let result = evaluate(q.dump(), data()).unwrap();
        assert_eq!(keys(&result), vec![3, 2, 1]);
    }

    #[test]
    fn list_properties_match_any_element() {
        let q = Query::new("Data").filter("Tags", FilterOp::Eq, "x");
        assert_eq!(keys(&evaluate(q.dump(), data()).unwrap()), vec![1, 2]);
    }

    #[test]
    fn cursors_offset_and_limit() {
        let q = Query::new("Data").start(Cursor::new(1)).offset(1).limit(5);
        let result = evaluate(q.dump(), data()).unwrap();
        assert_eq!(keys(&result), vec![3]);
        assert_eq!(result.first_position, 2);

        let q = Query::new("Data").end(Cursor::new(2));
        assert_eq!(keys(&evaluate(q.dump(), data()).unwrap()), vec![1, 2]);
    }

    #[test]
    fn keys_only_and_projection() {
        let q = Query::new("Data").keys_only();
        let result = evaluate(q.dump(), data()).unwrap();
        assert!(result.items.iter().all(|(_, p)| p.is_empty()));

        let q = Query::new("Data").project(&["Name"]);
        let result = evaluate(q.dump(), data()).unwrap();
        assert!(result.items.iter().all(|(_, p)| p.len() == 1 && p[0].name == "Name"));
    }

    #[test]
    fn ancestor_and_namespace() {
        let parent = Key::with_id("Org", 1, None);
        let child = Key::with_id("Data", 9, Some(&parent));
        let mut entities = data();
        entities.push((child.clone(), PropertyList::new()));
        entities.push((child.in_namespace("other"), PropertyList::new()));
        let q = Query::new("Data").ancestor(&parent);
        assert_eq!(keys(&evaluate(q.dump(), entities).unwrap()), vec![9]);
    }

    #[test]
    fn kindless_queries_cannot_be_ordered() {
        let q = Query::new("").order("Name");
        assert!(matches!(evaluate(q.dump(), data()), Err(Error::InvalidQuery(_))));
        let all = evaluate(Query::new("").dump(), data()).unwrap();
        assert_eq!(all.items.len(), 4);
    }

    #[test]
    fn distinct_on_keeps_first() {
        let mut entities = data();
        entities.push(entity(4, "a", &[]));
        let q = Query::new("Data").order("Name").distinct_on(&["Name"]);
        assert_eq!(keys(&evaluate(q.dump(), entities).unwrap()), vec![1, 2, 3]);
    }

    #[test]
    fn cross_type_comparison_uses_type_rank() {
        assert_eq!(compare_values(&Value::Int(100), &Value::Bool(false)), Ordering::Less);
        assert_eq!(compare_values(&Value::Null, &Value::Int(-5)), Ordering::Less);
        assert_eq!(
            compare_values(&Value::String("b".into()), &Value::Bytes(b"a".to_vec())),
            Ordering::Greater
        );
    }
}
