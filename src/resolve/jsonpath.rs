//! A small JSON-path engine for secret transforms.
//!
//! Supports the subset the location grammar needs: `$` for the root, dot
//! fields (`$.db.user`), bracketed fields (`$["odd key"]`), numeric indices
//! (`$.items[0]`), and wildcards (`$.items[*]`, `$.*`). A path that ends in
//! `[*]` always yields a list; otherwise a single-element result collapses to
//! the element itself.

use serde_json::Value;

use crate::error::{Error, Result};

/// One step through the value tree.
#[derive(Debug, Clone, PartialEq)]
enum Step {
    /// Named object field
    Field(String),
    /// List index
    Index(usize),
    /// All elements of a list or all values of an object
    Wildcard,
}

/// A parsed path expression.
#[derive(Debug, Clone)]
pub struct JsonPath {
    steps: Vec<Step>,
    /// Expression ended with `[*]`, so single matches stay wrapped in a list
    splat: bool,
}

impl JsonPath {
    /// Parse a path expression such as `$.db.user` or `$.items[*]`.
    pub fn parse(expr: &str) -> Result<JsonPath> {
        let expr = expr.trim();
        let splat = expr.ends_with("[*]");

        let mut rest = expr;
        if let Some(stripped) = rest.strip_prefix('$') {
            rest = stripped;
        }

        let mut steps = Vec::new();
        let mut chars = rest.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            match c {
                '.' => {
                    // Field name runs to the next '.' or '['
                    let start = i + 1;
                    let mut end = rest.len();
                    for (j, c2) in rest[start..].char_indices() {
                        if c2 == '.' || c2 == '[' {
                            end = start + j;
                            break;
                        }
                    }
                    let name = &rest[start..end];
                    if name == "*" {
                        steps.push(Step::Wildcard);
                    } else if !name.is_empty() {
                        steps.push(Step::Field(name.to_string()));
                    }
                    while chars.peek().map(|(j, _)| *j < end).unwrap_or(false) {
                        chars.next();
                    }
                }
                '[' => {
                    let start = i + 1;
                    let end = rest[start..]
                        .find(']')
                        .map(|j| start + j)
                        .ok_or_else(|| bad_path(expr, "unterminated '['"))?;
                    let token = rest[start..end].trim();
                    if token == "*" {
                        steps.push(Step::Wildcard);
                    } else if (token.starts_with('"') && token.ends_with('"'))
                        || (token.starts_with('\'') && token.ends_with('\''))
                    {
                        steps.push(Step::Field(token[1..token.len() - 1].to_string()));
                    } else {
                        let index: usize = token
                            .parse()
                            .map_err(|_| bad_path(expr, "index is not a number"))?;
                        steps.push(Step::Index(index));
                    }
                    while chars.peek().map(|(j, _)| *j <= end).unwrap_or(false) {
                        chars.next();
                    }
                }
                c if c.is_whitespace() => {}
                _ => return Err(bad_path(expr, "expected '.' or '['")),
            }
        }

        Ok(JsonPath { steps, splat })
    }

    /// Find all matches of this path in `value`.
    pub fn find(&self, value: &Value) -> Vec<Value> {
        let mut current = vec![value.clone()];

        for step in &self.steps {
            let mut next = Vec::new();
            for v in &current {
                match step {
                    Step::Field(name) => {
                        if let Some(found) = v.get(name.as_str()) {
                            next.push(found.clone());
                        }
                    }
                    Step::Index(i) => {
                        if let Some(found) = v.get(*i) {
                            next.push(found.clone());
                        }
                    }
                    Step::Wildcard => match v {
                        Value::Array(items) => next.extend(items.iter().cloned()),
                        Value::Object(map) => next.extend(map.values().cloned()),
                        _ => {}
                    },
                }
            }
            current = next;
        }

        current
    }

    /// Apply the path with the list-collapsing rule: an expression that does
    /// not end with `[*]` and matches exactly one element returns that
    /// element; otherwise the list of matches is returned.
    pub fn apply(&self, value: &Value) -> Result<Value> {
        let matches = self.find(value);

        if matches.is_empty() {
            return Err(Error::Resolution(
                "json path matched no elements".to_string(),
            ));
        }

        if matches.len() == 1 && !self.splat {
            Ok(matches.into_iter().next().unwrap_or(Value::Null))
        } else {
            Ok(Value::Array(matches))
        }
    }
}

fn bad_path(expr: &str, reason: &str) -> Error {
    Error::Resolution(format!("invalid json path '{expr}': {reason}"))
}
