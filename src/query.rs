//! Query Model
//!
//! Structured filters and query modifiers handed to the model store and
//! to the key normalizer.
//!
//! Filters keep their insertion order so that the normalizer, not the caller,
//! is responsible for producing a deterministic cache key.
//!
//! # Example
//!
//! ```rust
//! use hybrid_model_cache::{Filter, Op, Query};
//!
//! let query = Query::new(
//!     Filter::new()
//!         .eq("guild_id", "1234")
//!         .cmp("level", Op::Gte, 5),
//! )
//! .limit(10);
//!
//! assert!(!query.is_empty());
//! ```

use serde_json::Number;
use std::borrow::Cow;

/// Comparison and logical operators usable inside a filter
///
/// Operators are not plain field names; the normalizer renders each one as
/// a stable `$`-prefixed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Like,
    NotLike,
    Between,
    Is,
    Not,
    And,
    Or,
}

impl Op {
    /// Stable string token used in cache keys
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::Eq => "$eq",
            Self::Ne => "$ne",
            Self::Gt => "$gt",
            Self::Gte => "$gte",
            Self::Lt => "$lt",
            Self::Lte => "$lte",
            Self::In => "$in",
            Self::NotIn => "$notIn",
            Self::Like => "$like",
            Self::NotLike => "$notLike",
            Self::Between => "$between",
            Self::Is => "$is",
            Self::Not => "$not",
            Self::And => "$and",
            Self::Or => "$or",
        }
    }
}

/// Key of a filter object: either a column name or an operator
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterKey {
    Field(String),
    Op(Op),
}

impl FilterKey {
    /// String form used when sorting and serializing
    ///
    /// Field names starting with `$` get one more `$` so they never read as
    /// an operator token.
    #[must_use]
    pub fn token(&self) -> Cow<'_, str> {
        match self {
            Self::Field(name) if name.starts_with('$') => Cow::Owned(format!("${name}")),
            Self::Field(name) => Cow::Borrowed(name.as_str()),
            Self::Op(op) => Cow::Borrowed(op.token()),
        }
    }

    /// Column name, if this key is not an operator
    #[must_use]
    pub fn as_field(&self) -> Option<&str> {
        match self {
            Self::Field(name) => Some(name),
            Self::Op(_) => None,
        }
    }
}

impl From<&str> for FilterKey {
    fn from(name: &str) -> Self {
        Self::Field(name.to_string())
    }
}

impl From<String> for FilterKey {
    fn from(name: String) -> Self {
        Self::Field(name)
    }
}

impl From<Op> for FilterKey {
    fn from(op: Op) -> Self {
        Self::Op(op)
    }
}

/// A filter value tree
///
/// Mirrors JSON, except that object keys may be operators and objects keep
/// the order in which entries were added.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<FilterValue>),
    Object(Vec<(FilterKey, FilterValue)>),
}

impl FilterValue {
    /// `true` for `Null`, empty arrays and empty objects
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Array(items) => items.is_empty(),
            Self::Object(entries) => entries.is_empty(),
            _ => false,
        }
    }
}

impl From<serde_json::Value> for FilterValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => Self::Object(
                map.into_iter()
                    .map(|(k, v)| (FilterKey::Field(k), Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&serde_json::Value> for FilterValue {
    fn from(value: &serde_json::Value) -> Self {
        Self::from(value.clone())
    }
}

impl From<bool> for FilterValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

macro_rules! filter_value_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for FilterValue {
            fn from(n: $t) -> Self {
                Self::Number(Number::from(n))
            }
        })*
    };
}

filter_value_from_int!(i32, i64, u32, u64, usize);

impl From<f64> for FilterValue {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or(Self::Null, Self::Number)
    }
}

impl<T: Into<FilterValue>> From<Vec<T>> for FilterValue {
    fn from(items: Vec<T>) -> Self {
        Self::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<FilterValue>> From<Option<T>> for FilterValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl From<Filter> for FilterValue {
    fn from(filter: Filter) -> Self {
        Self::Object(filter.entries)
    }
}

/// The `where` clause of a query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    entries: Vec<(FilterKey, FilterValue)>,
}

impl Filter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `field = value`
    #[must_use]
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.entries
            .push((FilterKey::Field(field.into()), value.into()));
        self
    }

    /// `field <op> value`, stored as `{ field: { op: value } }`
    #[must_use]
    pub fn cmp(mut self, field: impl Into<String>, op: Op, value: impl Into<FilterValue>) -> Self {
        self.entries.push((
            FilterKey::Field(field.into()),
            FilterValue::Object(vec![(FilterKey::Op(op), value.into())]),
        ));
        self
    }

    /// Any of the given filters must match
    #[must_use]
    pub fn any(mut self, filters: Vec<Filter>) -> Self {
        self.entries.push((
            FilterKey::Op(Op::Or),
            FilterValue::Array(filters.into_iter().map(FilterValue::from).collect()),
        ));
        self
    }

    /// All of the given filters must match
    #[must_use]
    pub fn all(mut self, filters: Vec<Filter>) -> Self {
        self.entries.push((
            FilterKey::Op(Op::And),
            FilterValue::Array(filters.into_iter().map(FilterValue::from).collect()),
        ));
        self
    }

    /// Raw entry insertion
    #[must_use]
    pub fn with(mut self, key: impl Into<FilterKey>, value: impl Into<FilterValue>) -> Self {
        self.entries.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[(FilterKey, FilterValue)] {
        &self.entries
    }

    /// Value bound to a plain column by `eq`
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FilterValue> {
        self.entries
            .iter()
            .find(|(key, _)| key.as_field() == Some(name))
            .map(|(_, value)| value)
    }
}

/// Build a filter from a JSON object; non-object values yield an empty filter.
impl From<serde_json::Value> for Filter {
    fn from(value: serde_json::Value) -> Self {
        match FilterValue::from(value) {
            FilterValue::Object(entries) => Self { entries },
            _ => Self::default(),
        }
    }
}

/// Sort direction for `order`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// A filter plus optional modifiers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filter: Filter,
    pub order: Vec<(String, Direction)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub attributes: Option<Vec<String>>,
    pub include: Vec<String>,
}

impl Query {
    #[must_use]
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order.push((field.into(), direction));
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    #[must_use]
    pub fn attributes<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Eager-load an association
    #[must_use]
    pub fn include(mut self, association: impl Into<String>) -> Self {
        self.include.push(association.into());
        self
    }

    /// A query with no `where` clause
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filter.is_empty()
    }
}

impl From<Filter> for Query {
    fn from(filter: Filter) -> Self {
        Self::new(filter)
    }
}
