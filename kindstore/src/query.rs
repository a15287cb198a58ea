use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::{Error, Key, ToValue, Transaction, Value, codec};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl FromStr for FilterOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "=" | "==" => Ok(FilterOp::Eq),
            "!=" => Ok(FilterOp::Ne),
            "<" => Ok(FilterOp::Lt),
            "<=" => Ok(FilterOp::Le),
            ">" => Ok(FilterOp::Gt),
            ">=" => Ok(FilterOp::Ge),
            other => Err(Error::InvalidQuery(format!("invalid operator {:?}", other))),
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    pub path: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Order {
    pub path: String,
    pub direction: Direction,
}

/// Position in a query's result set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Cursor {
    position: usize,
}

impl Cursor {
    pub fn new(position: usize) -> Self {
        Self { position }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn encode(&self) -> String {
        codec::encode_cursor(self)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Inspectable description of a query. Middlewares read it to decide what
/// to do and hand modified copies downstream.
#[derive(Clone, Debug, Default)]
pub struct QueryDump {
    pub kind: String,
    pub ancestor: Option<Key>,
    pub filters: Vec<Filter>,
    pub orders: Vec<Order>,
    pub offset: usize,
    pub limit: Option<usize>,
    pub start_cursor: Option<Cursor>,
    pub end_cursor: Option<Cursor>,
    pub keys_only: bool,
    pub projection: Vec<String>,
    pub distinct_on: Vec<String>,
    pub namespace: String,
    pub eventual_consistency: bool,
    pub transaction: Option<Transaction>,
}

impl QueryDump {
    pub fn is_kindless(&self) -> bool {
        self.kind.is_empty()
    }
}

/// Immutable query. Every modifier returns a new query.
#[derive(Clone, Debug)]
pub struct Query {
    dump: Arc<QueryDump>,
    err: Option<Error>,
}

impl Query {
    pub fn new(kind: impl Into<String>) -> Self {
        Query {
            dump: Arc::new(QueryDump {
                kind: kind.into(),
                ..Default::default()
            }),
            err: None,
        }
    }

    pub fn dump(&self) -> &QueryDump {
        &self.dump
    }

    /// The first error recorded by a modifier, if any.
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    pub(crate) fn checked_dump(&self) -> Result<QueryDump, Error> {
        match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok((*self.dump).clone()),
        }
    }

    fn modify(&self, f: impl FnOnce(&mut QueryDump) -> Result<(), Error>) -> Query {
        let mut q = self.clone();
        if q.err.is_some() {
            return q;
        }
        if let Err(err) = f(Arc::make_mut(&mut q.dump)) {
            q.err = Some(err);
        }
        q
    }

    pub fn filter(&self, path: impl Into<String>, op: FilterOp, value: impl ToValue) -> Query {
        let path = path.into();
        self.modify(|d| {
            if path.is_empty() {
                return Err(Error::InvalidQuery("empty filter path".to_string()));
            }
            let value = value.to_value()?;
            d.filters.push(Filter { path, op, value });
            Ok(())
        })
    }

    /// Filter written as `"Field op"`, e.g. `"Age >="`.
    pub fn filter_expr(&self, expr: &str, value: impl ToValue) -> Query {
        let mut parts = expr.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(path), Some(op), None) => match op.parse::<FilterOp>() {
                Ok(op) => self.filter(path, op, value),
                Err(err) => self.modify(|_| Err(err)),
            },
            _ => self.modify(|_| {
                Err(Error::InvalidQuery(format!("invalid filter {:?}", expr)))
            }),
        }
    }

    /// `"Name"` sorts ascending, `"-Name"` descending.
    pub fn order(&self, field: &str) -> Query {
        let field = field.trim();
        let (path, direction) = match field.strip_prefix('-') {
            Some(path) => (path.trim(), Direction::Descending),
            None => (field, Direction::Ascending),
        };
        self.modify(|d| {
            if path.is_empty() {
                return Err(Error::InvalidQuery("empty order".to_string()));
            }
            d.orders.push(Order {
                path: path.to_string(),
                direction,
            });
            Ok(())
        })
    }

    pub fn ancestor(&self, ancestor: &Key) -> Query {
        self.modify(|d| {
            ancestor.validate_complete()?;
            d.ancestor = Some(ancestor.clone());
            Ok(())
        })
    }

    pub fn start(&self, cursor: Cursor) -> Query {
        self.modify(|d| {
            d.start_cursor = Some(cursor);
            Ok(())
        })
    }

    pub fn end(&self, cursor: Cursor) -> Query {
        self.modify(|d| {
            d.end_cursor = Some(cursor);
            Ok(())
        })
    }

    pub fn limit(&self, limit: usize) -> Query {
        self.modify(|d| {
            d.limit = Some(limit);
            Ok(())
        })
    }

    pub fn offset(&self, offset: usize) -> Query {
        self.modify(|d| {
            d.offset = offset;
            Ok(())
        })
    }

    pub fn namespace(&self, namespace: impl Into<String>) -> Query {
        let namespace = namespace.into();
        self.modify(|d| {
            d.namespace = namespace;
            Ok(())
        })
    }

    pub fn transaction(&self, tx: &Transaction) -> Query {
        self.modify(|d| {
            d.transaction = Some(tx.clone());
            Ok(())
        })
    }

    pub fn keys_only(&self) -> Query {
        self.modify(|d| {
            d.keys_only = true;
            Ok(())
        })
    }

    pub fn project<S: AsRef<str>>(&self, fields: &[S]) -> Query {
        self.modify(|d| {
            d.projection
                .extend(fields.iter().map(|f| f.as_ref().to_string()));
            Ok(())
        })
    }

    pub fn distinct_on<S: AsRef<str>>(&self, fields: &[S]) -> Query {
        self.modify(|d| {
            d.distinct_on
                .extend(fields.iter().map(|f| f.as_ref().to_string()));
            Ok(())
        })
    }

    pub fn eventual_consistency(&self) -> Query {
        self.modify(|d| {
            d.eventual_consistency = true;
            Ok(())
        })
    }
}
