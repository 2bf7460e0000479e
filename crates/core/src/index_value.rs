//! Secondary-index value encoding
//!
//! Every indexed value becomes one sorted-set member of the form
//! `"<encodedValue>::<resourceID>"`. Numeric values also supply the score;
//! text and list values score 0 and are found by pattern matching instead.
//!
//! | variant     | member                          | score |
//! |-------------|---------------------------------|-------|
//! | `Int`       | `"4::id"`                       | 4     |
//! | `Float`     | `"2.5::id"`                     | 2.5   |
//! | `Text`      | `"intel::id"` (lowercased)      | 0     |
//! | `TextList`  | `"[a b]::id"` (lowercased)      | 0     |
//! | `FloatList` | `"[2.18 4.54]::id"`             | 0     |

use crate::error::{StoreError, StoreResult};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

/// Separator between the encoded value and the resource id
pub const MEMBER_SEPARATOR: &str = "::";

/// A value that can be stored in a secondary index
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    /// Integer, scored by value
    Int(i64),
    /// Float, scored by value
    Float(f64),
    /// Free text, matched by pattern
    Text(String),
    /// List of strings, matched by pattern
    TextList(Vec<String>),
    /// List of floats, filtered with a [`Condition`]
    FloatList(Vec<f64>),
}

/// One encoded sorted-set entry
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    /// Sorted-set member
    pub member: String,
    /// Sorted-set score
    pub score: f64,
}

fn format_float(v: f64) -> String {
    // Display never switches to exponent notation and prints the shortest
    // representation that round-trips.
    format!("{}", v)
}

fn bracket(items: impl Iterator<Item = String>) -> String {
    let joined: Vec<String> = items.collect();
    format!("[{}]", joined.join(" "))
}

impl IndexValue {
    /// The encoded value part of a member (everything before `::`)
    pub fn encoded(&self) -> String {
        match self {
            IndexValue::Int(v) => v.to_string(),
            IndexValue::Float(v) => format_float(*v),
            IndexValue::Text(s) => s.to_lowercase(),
            IndexValue::TextList(items) => bracket(items.iter().map(|s| s.to_lowercase())),
            IndexValue::FloatList(items) => bracket(items.iter().map(|v| format_float(*v))),
        }
    }

    /// Sorted-set score for this value
    pub fn score(&self) -> f64 {
        match self {
            IndexValue::Int(v) => *v as f64,
            IndexValue::Float(v) => *v,
            IndexValue::Text(_) | IndexValue::TextList(_) | IndexValue::FloatList(_) => 0.0,
        }
    }

    /// Encode this value for `resource_id`
    pub fn encode(&self, resource_id: &str) -> IndexEntry {
        IndexEntry {
            member: format!("{}{}{}", self.encoded(), MEMBER_SEPARATOR, resource_id),
            score: self.score(),
        }
    }

    /// Decode a member back into `(value, resource_id)`.
    ///
    /// The member text alone cannot tell an `Int` from a `Float` with no
    /// fractional part, nor a `Text` from a bracketed string, so decoding
    /// prefers the most specific reading: bracketed lists of numbers become
    /// `FloatList`, other bracketed lists `TextList`, integers `Int`, other
    /// numbers `Float`, everything else `Text`.
    pub fn decode(member: &str) -> Option<(IndexValue, String)> {
        let (encoded, id) = split_member(member)?;
        let value = if let Some(inner) = encoded
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
        {
            match parse_float_list(inner) {
                Some(floats) => IndexValue::FloatList(floats),
                None => IndexValue::TextList(
                    inner.split(' ').filter(|s| !s.is_empty()).map(str::to_string).collect(),
                ),
            }
        } else if let Ok(i) = encoded.parse::<i64>() {
            IndexValue::Int(i)
        } else if let Ok(f) = encoded.parse::<f64>() {
            IndexValue::Float(f)
        } else {
            IndexValue::Text(encoded.to_string())
        };
        Some((value, id.to_string()))
    }
}

impl From<i64> for IndexValue {
    fn from(v: i64) -> Self {
        IndexValue::Int(v)
    }
}

impl From<i32> for IndexValue {
    fn from(v: i32) -> Self {
        IndexValue::Int(v as i64)
    }
}

impl From<f64> for IndexValue {
    fn from(v: f64) -> Self {
        IndexValue::Float(v)
    }
}

impl From<&str> for IndexValue {
    fn from(v: &str) -> Self {
        IndexValue::Text(v.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(v: String) -> Self {
        IndexValue::Text(v)
    }
}

impl From<Vec<String>> for IndexValue {
    fn from(v: Vec<String>) -> Self {
        IndexValue::TextList(v)
    }
}

impl From<Vec<f64>> for IndexValue {
    fn from(v: Vec<f64>) -> Self {
        IndexValue::FloatList(v)
    }
}

impl TryFrom<&JsonValue> for IndexValue {
    type Error = StoreError;

    /// Convert a decoded JSON value.
    ///
    /// Booleans, nulls, objects, empty or mixed arrays are rejected.
    fn try_from(value: &JsonValue) -> StoreResult<Self> {
        let unsupported =
            || StoreError::undefined(format!("error while saving index, unsupported value type {}", value));
        match value {
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(IndexValue::Int(i))
                } else {
                    n.as_f64().map(IndexValue::Float).ok_or_else(unsupported)
                }
            }
            JsonValue::String(s) => Ok(IndexValue::Text(s.clone())),
            JsonValue::Array(items) if !items.is_empty() => {
                if items.iter().all(JsonValue::is_string) {
                    Ok(IndexValue::TextList(
                        items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
                    ))
                } else if items.iter().all(JsonValue::is_number) {
                    Ok(IndexValue::FloatList(items.iter().filter_map(JsonValue::as_f64).collect()))
                } else {
                    Err(unsupported())
                }
            }
            _ => Err(unsupported()),
        }
    }
}

/// Split a member into `(encoded value, resource id)`
///
/// The id is the segment directly after the first `::`.
pub fn split_member(member: &str) -> Option<(&str, &str)> {
    let mut parts = member.split(MEMBER_SEPARATOR);
    let encoded = parts.next()?;
    let id = parts.next()?;
    Some((encoded, id))
}

/// Resource id of a member, if it has one
pub fn member_id(member: &str) -> Option<&str> {
    split_member(member).map(|(_, id)| id)
}

fn parse_float_list(inner: &str) -> Option<Vec<f64>> {
    inner
        .split(' ')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f64>().ok())
        .collect()
}

/// Comparison applied to each element of a float-list member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// element == match
    Eq,
    /// element > match
    Gt,
    /// element >= match
    Ge,
    /// element < match
    Lt,
    /// element <= match
    Le,
}

impl Condition {
    /// Evaluate `element <op> target`
    pub fn eval(self, element: f64, target: f64) -> bool {
        match self {
            Condition::Eq => element == target,
            Condition::Gt => element > target,
            Condition::Ge => element >= target,
            Condition::Lt => element < target,
            Condition::Le => element <= target,
        }
    }

    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Condition::Eq => "eq",
            Condition::Gt => "gt",
            Condition::Ge => "ge",
            Condition::Lt => "lt",
            Condition::Le => "le",
        }
    }
}

impl FromStr for Condition {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        match s {
            "eq" => Ok(Condition::Eq),
            "gt" => Ok(Condition::Gt),
            "ge" => Ok(Condition::Ge),
            "lt" => Ok(Condition::Lt),
            "le" => Ok(Condition::Le),
            other => Err(StoreError::undefined(format!(
                "unsupported condition '{}', expected one of eq, gt, ge, lt, le",
                other
            ))),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse the bracketed float list of a member's value part.
///
/// `"[2.18 4.54]"` yields `[2.18, 4.54]`. Brackets are optional; any element
/// that is not a number is an error.
pub fn parse_list_value(encoded: &str) -> StoreResult<Vec<f64>> {
    let inner = encoded.replace(['[', ']'], "");
    inner
        .split(' ')
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>().map_err(|e| {
                StoreError::undefined(format!("invalid list element '{}' in '{}': {}", s, encoded, e))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn encode_int() {
        let entry = IndexValue::Int(4).encode("abc-123");
        assert_eq!(entry.member, "4::abc-123");
        assert_eq!(entry.score, 4.0);
    }

    #[test]
    fn encode_float_has_no_exponent() {
        assert_eq!(IndexValue::Float(2.5).encode("x").member, "2.5::x");
        assert_eq!(IndexValue::Float(4.0).encode("x").member, "4::x");
        assert_eq!(IndexValue::Float(1e21).encoded(), "1000000000000000000000");
    }

    #[test]
    fn encode_text_lowercases_and_scores_zero() {
        let entry = IndexValue::from("Intel").encode("abc");
        assert_eq!(entry.member, "intel::abc");
        assert_eq!(entry.score, 0.0);
    }

    #[test]
    fn encode_lists() {
        let text = IndexValue::TextList(vec!["Foo".into(), "BAR".into()]).encode("id");
        assert_eq!(text.member, "[foo bar]::id");
        let floats = IndexValue::FloatList(vec![2.18, 4.54]).encode("id");
        assert_eq!(floats.member, "[2.18 4.54]::id");
        assert_eq!(floats.score, 0.0);
    }

    #[test]
    fn decode_prefers_specific_readings() {
        assert_eq!(
            IndexValue::decode("[2.18 4.54]::id"),
            Some((IndexValue::FloatList(vec![2.18, 4.54]), "id".to_string()))
        );
        assert_eq!(
            IndexValue::decode("[a b]::id"),
            Some((IndexValue::TextList(vec!["a".into(), "b".into()]), "id".to_string()))
        );
        assert_eq!(
            IndexValue::decode("7::id"),
            Some((IndexValue::Int(7), "id".to_string()))
        );
        assert_eq!(IndexValue::decode("no-separator"), None);
    }

    #[test]
    fn json_conversion() {
        assert_eq!(IndexValue::try_from(&json!(4)).unwrap(), IndexValue::Int(4));
        assert_eq!(IndexValue::try_from(&json!(4.5)).unwrap(), IndexValue::Float(4.5));
        assert_eq!(
            IndexValue::try_from(&json!(["a", "b"])).unwrap(),
            IndexValue::TextList(vec!["a".into(), "b".into()])
        );
        assert_eq!(
            IndexValue::try_from(&json!([1, 2.5])).unwrap(),
            IndexValue::FloatList(vec![1.0, 2.5])
        );
    }

    #[test]
    fn json_conversion_rejects_other_shapes() {
        for bad in [json!(true), json!(null), json!({"a": 1}), json!([]), json!([1, "a"])] {
            let err = IndexValue::try_from(&bad).unwrap_err();
            assert!(err.message().contains("unsupported value type"), "{}", bad);
        }
    }

    #[test]
    fn member_id_takes_segment_after_separator() {
        assert_eq!(member_id("intel::abc-123"), Some("abc-123"));
        assert_eq!(member_id("a::b::c"), Some("b"));
        assert_eq!(member_id("0"), None);
    }

    #[test]
    fn condition_parsing() {
        assert_eq!("ge".parse::<Condition>().unwrap(), Condition::Ge);
        assert!("between".parse::<Condition>().is_err());
    }

    #[test]
    fn list_value_parsing() {
        assert_eq!(parse_list_value("[2.18 4.54]").unwrap(), vec![2.18, 4.54]);
        assert!(parse_list_value("[2.18 abc]").is_err());
    }

    proptest! {
        #[test]
        fn condition_matches_float_ordering(a in -1e6f64..1e6, b in -1e6f64..1e6) {
            prop_assert_eq!(Condition::Lt.eval(a, b), a < b);
            prop_assert_eq!(Condition::Ge.eval(a, b), !Condition::Lt.eval(a, b));
            prop_assert_eq!(Condition::Le.eval(a, b), !Condition::Gt.eval(a, b));
        }

        #[test]
        fn float_list_members_parse_back(values in proptest::collection::vec(-1e9f64..1e9, 1..6)) {
            let entry = IndexValue::FloatList(values.clone()).encode("rid");
            let (encoded, id) = split_member(&entry.member).unwrap();
            prop_assert_eq!(id, "rid");
            prop_assert_eq!(parse_list_value(encoded).unwrap(), values);
        }
    }
}
