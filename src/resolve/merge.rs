//! Merge strategies for fetched configuration mappings.
//!
//! Later locations take precedence over earlier ones at the leaf level. The
//! strategies differ in how they treat nested maps, lists, and mismatched
//! types at the same key path.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// How fetched dictionaries are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStrategy {
    /// Top-level keys overwrite
    Shallow,
    /// Recursive map merge, colliding non-map values replaced
    #[default]
    Deep,
    /// Like DEEP, lists replaced
    Replace,
    /// Like DEEP, lists concatenated
    Additive,
    /// Like REPLACE, but a type mismatch at the same key path is an error
    TypesafeReplace,
    /// Like ADDITIVE, but a type mismatch at the same key path is an error
    TypesafeAdditive,
}

impl MergeStrategy {
    pub fn from_name(name: &str) -> Option<MergeStrategy> {
        match name.trim().to_uppercase().as_str() {
            "SHALLOW" => Some(MergeStrategy::Shallow),
            "DEEP" => Some(MergeStrategy::Deep),
            "REPLACE" => Some(MergeStrategy::Replace),
            "ADDITIVE" => Some(MergeStrategy::Additive),
            "TYPESAFE_REPLACE" => Some(MergeStrategy::TypesafeReplace),
            "TYPESAFE_ADDITIVE" => Some(MergeStrategy::TypesafeAdditive),
            _ => None,
        }
    }

    fn typesafe(&self) -> bool {
        matches!(
            self,
            MergeStrategy::TypesafeReplace | MergeStrategy::TypesafeAdditive
        )
    }

    fn concat_lists(&self) -> bool {
        matches!(
            self,
            MergeStrategy::Additive | MergeStrategy::TypesafeAdditive
        )
    }
}

/// Merge `src` into `dest`, consuming both. `src` wins at the leaf level.
pub fn merge_values(dest: Value, src: Value, strategy: MergeStrategy) -> Result<Value> {
    merge_inner(dest, src, strategy, "")
}

fn merge_inner(dest: Value, src: Value, strategy: MergeStrategy, path: &str) -> Result<Value> {
    if strategy == MergeStrategy::Shallow {
        return match (dest, src) {
            (Value::Object(mut d), Value::Object(s)) => {
                for (k, v) in s {
                    d.insert(k, v);
                }
                Ok(Value::Object(d))
            }
            (_, s) => Ok(s),
        };
    }

    match (dest, src) {
        (Value::Object(mut d), Value::Object(s)) => {
            for (k, sv) in s {
                let child_path = if path.is_empty() {
                    k.clone()
                } else {
                    format!("{path}.{k}")
                };
                match d.remove(&k) {
                    Some(dv) => {
                        let merged = merge_inner(dv, sv, strategy, &child_path)?;
                        d.insert(k, merged);
                    }
                    None => {
                        d.insert(k, sv);
                    }
                }
            }
            Ok(Value::Object(d))
        }
        (Value::Array(mut d), Value::Array(s)) => {
            if strategy.concat_lists() {
                d.extend(s);
                Ok(Value::Array(d))
            } else {
                Ok(Value::Array(s))
            }
        }
        (d, s) => {
            if strategy.typesafe() && !same_kind(&d, &s) {
                return Err(Error::Resolution(format!(
                    "type mismatch at '{}' merging {} into {}",
                    path,
                    kind_name(&s),
                    kind_name(&d)
                )));
            }
            Ok(s)
        }
    }
}

fn same_kind(a: &Value, b: &Value) -> bool {
    kind_name(a) == kind_name(b) || a.is_null() || b.is_null()
}

fn kind_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strategy_names() {
        assert_eq!(
            MergeStrategy::from_name("typesafe_additive"),
            Some(MergeStrategy::TypesafeAdditive)
        );
        assert_eq!(MergeStrategy::from_name("DEEP"), Some(MergeStrategy::Deep));
        assert_eq!(MergeStrategy::from_name("bogus"), None);
    }

    #[test]
    fn test_shallow_overwrites_top_level() {
        let d = json!({"a": {"x": 1}, "b": 2});
        let s = json!({"a": {"y": 3}});
        let merged = merge_values(d, s, MergeStrategy::Shallow).unwrap();
        assert_eq!(merged, json!({"a": {"y": 3}, "b": 2}));
    }

    #[test]
    fn test_deep_merges_nested_maps() {
        let d = json!({"a": {"x": 1, "z": 0}, "b": 2});
        let s = json!({"a": {"y": 3, "z": 9}});
        let merged = merge_values(d, s, MergeStrategy::Deep).unwrap();
        assert_eq!(merged, json!({"a": {"x": 1, "y": 3, "z": 9}, "b": 2}));
    }

    #[test]
    fn test_replace_vs_additive_lists() {
        let d = json!({"l": [1, 2]});
        let s = json!({"l": [3]});

        let replaced = merge_values(d.clone(), s.clone(), MergeStrategy::Replace).unwrap();
        assert_eq!(replaced, json!({"l": [3]}));

        let added = merge_values(d, s, MergeStrategy::Additive).unwrap();
        assert_eq!(added, json!({"l": [1, 2, 3]}));
    }

    #[test]
    fn test_deep_replaces_lists() {
        let merged =
            merge_values(json!({"l": [1]}), json!({"l": [2, 3]}), MergeStrategy::Deep).unwrap();
        assert_eq!(merged, json!({"l": [2, 3]}));
    }

    #[test]
    fn test_typesafe_rejects_mismatch() {
        let d = json!({"a": 1});
        let s = json!({"a": "one"});
        assert!(merge_values(d.clone(), s.clone(), MergeStrategy::TypesafeReplace).is_err());
        // The lenient strategies accept the replacement
        assert!(merge_values(d, s, MergeStrategy::Replace).is_ok());
    }

    #[test]
    fn test_typesafe_allows_null_replacement() {
        let merged = merge_values(
            json!({"a": null}),
            json!({"a": 5}),
            MergeStrategy::TypesafeAdditive,
        )
        .unwrap();
        assert_eq!(merged, json!({"a": 5}));
    }

    #[test]
    fn test_later_wins_at_leaf() {
        let merged = merge_values(
            json!({"k": "old"}),
            json!({"k": "new"}),
            MergeStrategy::Deep,
        )
        .unwrap();
        assert_eq!(merged, json!({"k": "new"}));
    }
}
