//! CQL values, rows and typed decoding.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::DbError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CqlValue {
    Null,
    Boolean(bool),
    Int(i32),
    BigInt(i64),
    Text(String),
    List(Vec<CqlValue>),
    Set(Vec<CqlValue>),
    Map(Vec<(CqlValue, CqlValue)>),
}

impl CqlValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            CqlValue::Null => "null",
            CqlValue::Boolean(_) => "boolean",
            CqlValue::Int(_) => "int",
            CqlValue::BigInt(_) => "bigint",
            CqlValue::Text(_) => "text",
            CqlValue::List(_) => "list",
            CqlValue::Set(_) => "set",
            CqlValue::Map(_) => "map",
        }
    }

    pub fn text_set<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CqlValue::Set(items.into_iter().map(|s| CqlValue::Text(s.into())).collect())
    }

    pub fn text_map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        CqlValue::Map(entries.into_iter().map(|(k, v)| (CqlValue::Text(k.into()), CqlValue::Text(v.into()))).collect())
    }
}

impl From<&str> for CqlValue {
    fn from(v: &str) -> Self { CqlValue::Text(v.to_string()) }
}

impl From<String> for CqlValue {
    fn from(v: String) -> Self { CqlValue::Text(v) }
}

impl From<bool> for CqlValue {
    fn from(v: bool) -> Self { CqlValue::Boolean(v) }
}

impl From<i32> for CqlValue {
    fn from(v: i32) -> Self { CqlValue::Int(v) }
}

/// Decode a single column value.
pub trait FromCql: Sized {
    fn from_cql(v: &CqlValue) -> Result<Self, String>;
}

fn mismatch<T>(want: &str, got: &CqlValue) -> Result<T, String> {
    Err(format!("expected {}, got {}", want, got.type_name()))
}

impl FromCql for bool {
    fn from_cql(v: &CqlValue) -> Result<Self, String> {
        match v {
            CqlValue::Boolean(b) => Ok(*b),
            other => mismatch("boolean", other),
        }
    }
}

impl FromCql for i32 {
    fn from_cql(v: &CqlValue) -> Result<Self, String> {
        match v {
            CqlValue::Int(n) => Ok(*n),
            CqlValue::BigInt(n) => i32::try_from(*n).map_err(|e| e.to_string()),
            other => mismatch("int", other),
        }
    }
}

impl FromCql for i64 {
    fn from_cql(v: &CqlValue) -> Result<Self, String> {
        match v {
            CqlValue::Int(n) => Ok(i64::from(*n)),
            CqlValue::BigInt(n) => Ok(*n),
            other => mismatch("bigint", other),
        }
    }
}

impl FromCql for String {
    fn from_cql(v: &CqlValue) -> Result<Self, String> {
        match v {
            CqlValue::Text(s) => Ok(s.clone()),
            other => mismatch("text", other),
        }
    }
}

impl<T: FromCql> FromCql for Option<T> {
    fn from_cql(v: &CqlValue) -> Result<Self, String> {
        match v {
            CqlValue::Null => Ok(None),
            other => T::from_cql(other).map(Some),
        }
    }
}

impl<T: FromCql> FromCql for Vec<T> {
    fn from_cql(v: &CqlValue) -> Result<Self, String> {
        match v {
            CqlValue::List(items) | CqlValue::Set(items) => items.iter().map(T::from_cql).collect(),
            // an empty collection reads back as null
            CqlValue::Null => Ok(Vec::new()),
            other => mismatch("list", other),
        }
    }
}

impl<T: FromCql + Ord> FromCql for BTreeSet<T> {
    fn from_cql(v: &CqlValue) -> Result<Self, String> {
        Vec::<T>::from_cql(v).map(|items| items.into_iter().collect())
    }
}

impl<K: FromCql + Ord, V: FromCql> FromCql for BTreeMap<K, V> {
    fn from_cql(v: &CqlValue) -> Result<Self, String> {
        match v {
            CqlValue::Map(entries) => entries.iter().map(|(k, v)| Ok((K::from_cql(k)?, V::from_cql(v)?))).collect(),
            CqlValue::Null => Ok(BTreeMap::new()),
            other => mismatch("map", other),
        }
    }
}

/// One result row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row(pub Vec<CqlValue>);

impl Row {
    pub fn new(values: Vec<CqlValue>) -> Self { Self(values) }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn get<T: FromCql>(&self, column: usize) -> Result<T, DbError> {
        let v = self
            .0
            .get(column)
            .ok_or_else(|| DbError::Decode { column, reason: format!("row has {} columns", self.0.len()) })?;
        T::from_cql(v).map_err(|reason| DbError::Decode { column, reason })
    }
}

/// Decode a whole row into a tuple of outputs.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self, DbError>;
}

macro_rules! tuple_from_row {
    ($($t:ident => $idx:tt),+) => {
        impl<$($t: FromCql),+> FromRow for ($($t,)+) {
            fn from_row(row: &Row) -> Result<Self, DbError> {
                Ok(($(row.get::<$t>($idx)?,)+))
            }
        }
    };
}

tuple_from_row!(A => 0);
tuple_from_row!(A => 0, B => 1);
tuple_from_row!(A => 0, B => 1, C => 2);
tuple_from_row!(A => 0, B => 1, C => 2, D => 3);
