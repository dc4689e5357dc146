//! Cache Key Normalizer
//!
//! Turns a query into a deterministic cache key of the form
//! `{version}:{model}:{body}`.
//!
//! The body is a canonical serialization of the query: object keys are sorted
//! at every level, operators are rendered as `$`-tokens and query modifiers are
//! folded into the same object. Two semantically identical queries always
//! produce the same key regardless of insertion order. Nothing is hashed, so
//! distinct queries never collide.

use std::fmt;
use std::fmt::Write as _;

use crate::query::{FilterKey, FilterValue, Query};

/// Deterministic string identifying one cached query result
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Which accessor a key belongs to
///
/// Point lookups carry no marker so that keys computed from a saved instance
/// match the keys `get_one` reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    One,
    All,
    Count,
}

impl QueryKind {
    fn marker(self) -> Option<&'static str> {
        match self {
            Self::One => None,
            Self::All => Some("all"),
            Self::Count => Some("count"),
        }
    }
}

/// Input of [`normalize`]
#[derive(Debug, Clone, Copy)]
pub enum KeyBody<'a> {
    /// Used verbatim as the key body
    Raw(&'a str),
    /// Canonically serialized
    Query(&'a Query, QueryKind),
}

/// Build the cache key for a query owned by `model`
#[must_use]
pub fn normalize(version: &str, model: &str, body: KeyBody<'_>) -> CacheKey {
    let mut key = namespace_prefix(version, model);
    match body {
        KeyBody::Raw(raw) => key.push_str(raw),
        KeyBody::Query(query, kind) => write_query(&mut key, query, kind),
    }
    CacheKey(key)
}

/// Prefix shared by every key of one model: `{version}:{model}:`
#[must_use]
pub fn namespace_prefix(version: &str, model: &str) -> String {
    format!("{version}:{model}:")
}

fn write_query(out: &mut String, query: &Query, kind: QueryKind) {
    // Top-level entries, already in lexicographic order.
    let mut first = true;
    let mut sep = |out: &mut String| {
        if first {
            first = false;
        } else {
            out.push(',');
        }
    };

    out.push('{');

    if !query.attributes.as_ref().is_none_or(Vec::is_empty) {
        sep(out);
        write_string(out, "attributes");
        out.push(':');
        let mut fields: Vec<&String> = query.attributes.iter().flatten().collect();
        fields.sort();
        write_string_list(out, fields);
    }

    if !query.include.is_empty() {
        sep(out);
        write_string(out, "include");
        out.push(':');
        let mut assocs: Vec<&String> = query.include.iter().collect();
        assocs.sort();
        write_string_list(out, assocs);
    }

    if let Some(marker) = kind.marker() {
        sep(out);
        write_string(out, "kind");
        out.push(':');
        write_string(out, marker);
    }

    if let Some(limit) = query.limit {
        sep(out);
        let _ = write!(out, "\"limit\":{limit}");
    }

    if let Some(offset) = query.offset {
        sep(out);
        let _ = write!(out, "\"offset\":{offset}");
    }

    // Order is significant, so it is not sorted.
    if !query.order.is_empty() {
        sep(out);
        write_string(out, "order");
        out.push_str(":[");
        for (i, (field, direction)) in query.order.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push('[');
            write_string(out, field);
            out.push(',');
            write_string(out, direction.as_str());
            out.push(']');
        }
        out.push(']');
    }

    sep(out);
    write_string(out, "where");
    out.push(':');
    write_entries(out, query.filter.entries());

    out.push('}');
}

fn write_value(out: &mut String, value: &FilterValue) {
    match value {
        FilterValue::Null => out.push_str("null"),
        FilterValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        FilterValue::Number(n) => {
            let _ = write!(out, "{n}");
        }
        FilterValue::String(s) => write_string(out, s),
        FilterValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        FilterValue::Object(entries) => write_entries(out, entries),
    }
}

fn write_entries(out: &mut String, entries: &[(FilterKey, FilterValue)]) {
    let mut sorted: Vec<&(FilterKey, FilterValue)> = entries.iter().collect();
    sorted.sort_by(|a, b| a.0.token().cmp(&b.0.token()));

    out.push('{');
    for (i, (key, value)) in sorted.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(out, &key.token());
        out.push(':');
        write_value(out, value);
    }
    out.push('}');
}

fn write_string_list(out: &mut String, items: Vec<&String>) {
    out.push('[');
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(out, item);
    }
    out.push(']');
}

fn write_string(out: &mut String, s: &str) {
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        // Serializing a &str cannot fail; keep the raw text just in case.
        Err(_) => {
            out.push('"');
            out.push_str(s);
            out.push('"');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Direction, Filter, Op};
    use serde_json::json;

    fn one(query: &Query) -> CacheKey {
        normalize("v1", "User", KeyBody::Query(query, QueryKind::One))
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let a = Query::new(Filter::new().eq("b", 2).eq("a", 1));
        let b = Query::new(Filter::new().eq("a", 1).eq("b", 2));
        assert_eq!(one(&a), one(&b));
        assert_eq!(one(&a).as_str(), r#"v1:User:{"where":{"a":1,"b":2}}"#);
    }

    #[test]
    fn test_nested_objects_are_sorted() {
        let a = Query::from(Filter::from(json!({"meta": {"z": 1, "y": [ {"q": 1, "p": 2} ]}})));
        let b = Query::from(Filter::from(json!({"meta": {"y": [ {"p": 2, "q": 1} ], "z": 1}})));
        assert_eq!(one(&a), one(&b));
    }

    #[test]
    fn test_operators_are_distinct_from_equality() {
        let eq = Query::new(Filter::new().eq("level", 5));
        let gt = Query::new(Filter::new().cmp("level", Op::Gt, 5));
        assert_ne!(one(&eq), one(&gt));
        assert!(one(&gt).as_str().contains(r#""$gt":5"#));
    }

    #[test]
    fn test_dollar_field_is_not_an_operator() {
        let op = Query::new(Filter::new().cmp("level", Op::Gt, 5));
        // Object keys from JSON are plain column names, even with a `$`
        let field = Query::from(Filter::from(json!({"level": {"$gt": 5}})));
        assert_ne!(one(&op), one(&field));
        assert!(one(&field).as_str().contains(r#""$$gt":5"#));
    }

    #[test]
    fn test_array_order_is_preserved() {
        let a = Query::new(Filter::new().cmp("id", Op::In, vec![1, 2]));
        let b = Query::new(Filter::new().cmp("id", Op::In, vec![2, 1]));
        assert_ne!(one(&a), one(&b));
    }

    #[test]
    fn test_modifiers_are_part_of_key() {
        let base = Query::new(Filter::new().eq("guild_id", "9"));
        let limited = base.clone().limit(5);
        let ordered = base.clone().order_by("xp", Direction::Desc);
        assert_ne!(one(&base), one(&limited));
        assert_ne!(one(&base), one(&ordered));
        assert_ne!(one(&limited), one(&ordered));

        let attrs_a = base.clone().attributes(["name", "id"]);
        let attrs_b = base.attributes(["id", "name"]);
        assert_eq!(one(&attrs_a), one(&attrs_b));
    }

    #[test]
    fn test_kinds_do_not_collide() {
        let query = Query::new(Filter::new().eq("id", 1));
        let keys = [
            normalize("v1", "User", KeyBody::Query(&query, QueryKind::One)),
            normalize("v1", "User", KeyBody::Query(&query, QueryKind::All)),
            normalize("v1", "User", KeyBody::Query(&query, QueryKind::Count)),
        ];
        assert_ne!(keys[0], keys[1]);
        assert_ne!(keys[1], keys[2]);
        assert_ne!(keys[0], keys[2]);
    }

    #[test]
    fn test_raw_body_and_prefix() {
        let key = normalize("v2", "Guild", KeyBody::Raw("settings"));
        assert_eq!(key.as_str(), "v2:Guild:settings");
        assert!(key.as_str().starts_with(&namespace_prefix("v2", "Guild")));
    }

    #[test]
    fn test_version_bump_changes_key() {
        let query = Query::new(Filter::new().eq("id", 1));
        let v1 = normalize("v1", "User", KeyBody::Query(&query, QueryKind::One));
        let v2 = normalize("v2", "User", KeyBody::Query(&query, QueryKind::One));
        assert_ne!(v1, v2);
    }

    #[test]
    fn test_strings_are_escaped() {
        let a = Query::new(Filter::new().eq("name", "a\",\"b"));
        let b = Query::new(Filter::new().eq("name", "a").eq("b", ""));
        assert_ne!(one(&a), one(&b));
    }
}
