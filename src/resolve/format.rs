//! Value formats and parsing.
//!
//! Raw bytes fetched from a secret source are parsed into a structured
//! `serde_json::Value` using an explicit or guessed format. The same formats
//! are used to write resolved env/config output files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Format of a fetched or written value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueFormat {
    Dotenv,
    Json,
    Yaml,
    Text,
}

impl ValueFormat {
    /// Parse a format name, as used in location strings and CLI options.
    pub fn from_name(name: &str) -> Option<ValueFormat> {
        match name.trim().to_lowercase().as_str() {
            "dotenv" => Some(ValueFormat::Dotenv),
            "json" => Some(ValueFormat::Json),
            "yaml" => Some(ValueFormat::Yaml),
            "text" => Some(ValueFormat::Text),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ValueFormat::Dotenv => "dotenv",
            ValueFormat::Json => "json",
            ValueFormat::Yaml => "yaml",
            ValueFormat::Text => "text",
        }
    }

    /// Guess the format from a filename or location string.
    ///
    /// `.env.` anywhere in the name wins (covers `.env.production` style
    /// names that have no useful extension).
    pub fn guess_from_location(location: &str) -> Option<ValueFormat> {
        if location.contains(".env.") || location.ends_with(".env") {
            return Some(ValueFormat::Dotenv);
        }

        // Version suffixes like `bucket/key.json#v3` hide the extension
        let location = location.split('#').next().unwrap_or(location);

        let extension = location.rsplit('.').next()?;
        match extension.to_lowercase().as_str() {
            "env" => Some(ValueFormat::Dotenv),
            "json" => Some(ValueFormat::Json),
            "yaml" | "yml" => Some(ValueFormat::Yaml),
            _ => None,
        }
    }

    /// Guess the format from a MIME type hint returned by a provider.
    pub fn guess_from_mime_type(mime_type: &str) -> Option<ValueFormat> {
        let mime = mime_type
            .split(';')
            .next()
            .unwrap_or(mime_type)
            .trim()
            .to_lowercase();
        match mime.as_str() {
            "application/json" | "text/x-json" => Some(ValueFormat::Json),
            "application/x-yaml" | "application/yaml" | "text/vnd.yaml" | "text/yaml"
            | "text/x-yaml" => Some(ValueFormat::Yaml),
            _ => None,
        }
    }
}

impl std::fmt::Display for ValueFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Parse a raw string into a structured value using the given format.
///
/// `dotenv` yields a flat string map, `json`/`yaml` arbitrary values, and
/// `text` the unmodified string.
pub fn parse_value(raw: &str, format: ValueFormat) -> Result<Value> {
    match format {
        ValueFormat::Json => {
            serde_json::from_str(raw).map_err(|e| Error::Resolution(format!("bad json: {e}")))
        }
        ValueFormat::Yaml => {
            serde_yaml::from_str(raw).map_err(|e| Error::Resolution(format!("bad yaml: {e}")))
        }
        ValueFormat::Dotenv => {
            let map = parse_dotenv(raw)?;
            let mut obj = serde_json::Map::new();
            for (k, v) in map {
                obj.insert(k, Value::String(v));
            }
            Ok(Value::Object(obj))
        }
        ValueFormat::Text => Ok(Value::String(raw.to_string())),
    }
}

/// Parse dotenv-style text into an ordered name/value map.
///
/// Supports `#` comments, optional `export ` prefixes, and single/double
/// quoted values with `\n`/`\t` escapes inside double quotes.
pub fn parse_dotenv(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();

    for (line_no, line) in raw.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed).trim();

        let eq = trimmed.find('=').ok_or_else(|| {
            Error::Resolution(format!("dotenv line {} has no '='", line_no + 1))
        })?;

        let name = trimmed[..eq].trim();
        if name.is_empty() {
            return Err(Error::Resolution(format!(
                "dotenv line {} has an empty name",
                line_no + 1
            )));
        }

        let value = unquote_dotenv(trimmed[eq + 1..].trim());
        map.insert(name.to_string(), value);
    }

    Ok(map)
}

fn unquote_dotenv(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        let inner = &value[1..value.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(other) => out.push(other),
                    None => out.push('\\'),
                }
            } else {
                out.push(c);
            }
        }
        out
    } else if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

/// Serialize a flat string map as dotenv text.
///
/// Values containing whitespace, quotes, or `#` are double-quoted with
/// newlines and tabs escaped, so fields without control characters
/// round-trip through [parse_dotenv].
pub fn serialize_dotenv(map: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (name, value) in map {
        let needs_quotes = value.is_empty()
            || value
                .chars()
                .any(|c| c.is_whitespace() || c == '"' || c == '\'' || c == '#');
        if needs_quotes {
            let escaped = value
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "\\n")
                .replace('\t', "\\t");
            out.push_str(&format!("{}=\"{}\"\n", name, escaped));
        } else {
            out.push_str(&format!("{}={}\n", name, value));
        }
    }
    out
}

/// Project a structured value to the flat string form used for child
/// environment variables.
///
/// Booleans become `TRUE`/`FALSE`, collections are JSON-encoded, null is the
/// empty string, and everything else uses its canonical textual form.
pub fn stringify_env_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Serialize a value for an output file in the given format.
pub fn serialize_value(value: &Value, format: ValueFormat) -> Result<String> {
    match format {
        ValueFormat::Json => Ok(serde_json::to_string_pretty(value)?),
        ValueFormat::Yaml => Ok(serde_yaml::to_string(value)?),
        ValueFormat::Dotenv => {
            let obj = value.as_object().ok_or_else(|| {
                Error::Resolution("dotenv output requires a top-level mapping".to_string())
            })?;
            let mut map = BTreeMap::new();
            for (k, v) in obj {
                map.insert(k.clone(), stringify_env_value(v));
            }
            Ok(serialize_dotenv(&map))
        }
        ValueFormat::Text => Ok(stringify_env_value(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_from_name() {
        assert_eq!(ValueFormat::from_name("JSON"), Some(ValueFormat::Json));
        assert_eq!(ValueFormat::from_name(" yaml "), Some(ValueFormat::Yaml));
        assert_eq!(ValueFormat::from_name("dotenv"), Some(ValueFormat::Dotenv));
        assert_eq!(ValueFormat::from_name("toml"), None);
    }

    #[test]
    fn test_guess_from_location() {
        assert_eq!(
            ValueFormat::guess_from_location("config.json"),
            Some(ValueFormat::Json)
        );
        assert_eq!(
            ValueFormat::guess_from_location("a/b/settings.YML"),
            Some(ValueFormat::Yaml)
        );
        assert_eq!(
            ValueFormat::guess_from_location(".env.production"),
            Some(ValueFormat::Dotenv)
        );
        assert_eq!(
            ValueFormat::guess_from_location("bucket/key.json#v12"),
            Some(ValueFormat::Json)
        );
        assert_eq!(ValueFormat::guess_from_location("no-extension"), None);
    }

    #[test]
    fn test_guess_from_mime_type() {
        assert_eq!(
            ValueFormat::guess_from_mime_type("application/json; charset=utf-8"),
            Some(ValueFormat::Json)
        );
        assert_eq!(
            ValueFormat::guess_from_mime_type("text/yaml"),
            Some(ValueFormat::Yaml)
        );
        assert_eq!(ValueFormat::guess_from_mime_type("text/plain"), None);
    }

    #[test]
    fn test_parse_dotenv_basics() {
        let parsed = parse_dotenv("A=1\n# comment\nexport B=two\nC=\"x y\"\nD='q'\n").unwrap();
        assert_eq!(parsed.get("A").unwrap(), "1");
        assert_eq!(parsed.get("B").unwrap(), "two");
        assert_eq!(parsed.get("C").unwrap(), "x y");
        assert_eq!(parsed.get("D").unwrap(), "q");
    }

    #[test]
    fn test_parse_dotenv_escapes() {
        let parsed = parse_dotenv("MSG=\"line1\\nline2\\ttabbed\"").unwrap();
        assert_eq!(parsed.get("MSG").unwrap(), "line1\nline2\ttabbed");
    }

    #[test]
    fn test_parse_dotenv_rejects_missing_equals() {
        assert!(parse_dotenv("JUSTANAME").is_err());
    }

    #[test]
    fn test_dotenv_round_trip() {
        let mut map = BTreeMap::new();
        map.insert("PLAIN".to_string(), "value".to_string());
        map.insert("SPACED".to_string(), "a b c".to_string());
        map.insert("EMPTY".to_string(), String::new());
        map.insert("QUOTED".to_string(), "say \"hi\"".to_string());

        let text = serialize_dotenv(&map);
        let parsed = parse_dotenv(&text).unwrap();
        assert_eq!(parsed, map);
    }

    #[test]
    fn test_parse_value_json_and_text() {
        let v = parse_value("{\"a\": 1}", ValueFormat::Json).unwrap();
        assert_eq!(v, json!({"a": 1}));
        let v = parse_value("{\"a\": 1}", ValueFormat::Text).unwrap();
        assert_eq!(v, json!("{\"a\": 1}"));
    }

    #[test]
    fn test_parse_value_dotenv_is_flat_map() {
        let v = parse_value("A=1\nB=2\n", ValueFormat::Dotenv).unwrap();
        assert_eq!(v, json!({"A": "1", "B": "2"}));
    }

    #[test]
    fn test_stringify_env_value() {
        assert_eq!(stringify_env_value(&json!(true)), "TRUE");
        assert_eq!(stringify_env_value(&json!(false)), "FALSE");
        assert_eq!(stringify_env_value(&json!(null)), "");
        assert_eq!(stringify_env_value(&json!(42)), "42");
        assert_eq!(stringify_env_value(&json!("s")), "s");
        assert_eq!(stringify_env_value(&json!([1, 2])), "[1,2]");
        assert_eq!(stringify_env_value(&json!({"k": "v"})), "{\"k\":\"v\"}");
    }

    #[test]
    fn test_serialize_value_dotenv() {
        let out = serialize_value(&json!({"A": 1, "B": true}), ValueFormat::Dotenv).unwrap();
        let parsed = parse_dotenv(&out).unwrap();
        assert_eq!(parsed.get("A").unwrap(), "1");
        assert_eq!(parsed.get("B").unwrap(), "TRUE");
    }
}
