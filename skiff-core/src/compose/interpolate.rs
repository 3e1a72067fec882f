//! Environment variable interpolation for compose files.
//!
//! Applied to every string leaf of the decoded YAML tree before the typed
//! schema is read. Supported forms: `$VAR`, `${VAR}`, `${VAR:-default}`,
//! `${VAR:?message}` and `$$` for a literal dollar sign.

use serde_yaml::Value;

/// Interpolation failure for a single variable reference.
#[derive(Debug)]
pub struct InterpolateError {
    pub variable: String,
    pub message: String,
}

/// Walk a YAML tree and interpolate every string value in place.
pub fn interpolate_tree<F>(value: &mut Value, lookup: &F) -> Result<(), InterpolateError>
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(s) => {
            *s = interpolate(s, lookup)?;
            Ok(())
        }
        Value::Sequence(items) => {
            for item in items {
                interpolate_tree(item, lookup)?;
            }
            Ok(())
        }
        Value::Mapping(mapping) => {
            for (_, v) in mapping.iter_mut() {
                interpolate_tree(v, lookup)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Interpolate a single string.
pub fn interpolate<F>(input: &str, lookup: &F) -> Result<String, InterpolateError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().map(|(_, c)| *c) {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('{') => {
                chars.next();
                let mut inner = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    inner.push(c);
                }
                if !closed {
                    return Err(InterpolateError {
                        variable: inner,
                        message: "unterminated variable reference".to_string(),
                    });
                }
                out.push_str(&substitute(&inner, lookup)?);
            }
            Some(c) if is_name_start(c) => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if is_name_char(*c) {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&lookup(&name).unwrap_or_default());
            }
            // a dollar sign not introducing a reference stays literal
            _ => out.push('$'),
        }
    }
    Ok(out)
}

/// Resolve the inside of a `${...}` reference, handling `:-` and `:?`.
fn substitute<F>(inner: &str, lookup: &F) -> Result<String, InterpolateError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some((name, default)) = inner.split_once(":-") {
        check_name(name, inner)?;
        return Ok(match lookup(name) {
            Some(v) if !v.is_empty() => v,
            _ => default.to_string(),
        });
    }
    if let Some((name, message)) = inner.split_once(":?") {
        check_name(name, inner)?;
        return match lookup(name) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(InterpolateError {
                variable: name.to_string(),
                message: if message.is_empty() {
                    "required variable is not set".to_string()
                } else {
                    message.to_string()
                },
            }),
        };
    }
    check_name(inner, inner)?;
    Ok(lookup(inner).unwrap_or_default())
}

fn check_name(name: &str, reference: &str) -> Result<(), InterpolateError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) => is_name_start(c) && chars.all(is_name_char),
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(InterpolateError {
            variable: reference.to_string(),
            message: "invalid variable name".to_string(),
        })
    }
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_plain_variable() {
        let lookup = env(&[("USER", "alice")]);
        assert_eq!(interpolate("hello $USER!", &lookup).unwrap(), "hello alice!");
        assert_eq!(interpolate("${USER}", &lookup).unwrap(), "alice");
    }

    #[test]
    fn test_unset_variable_is_empty() {
        let lookup = env(&[]);
        assert_eq!(interpolate("x$MISSING/y", &lookup).unwrap(), "x/y");
    }

    #[test]
    fn test_default_value() {
        let lookup = env(&[("SET", "v")]);
        assert_eq!(interpolate("${SET:-fallback}", &lookup).unwrap(), "v");
        assert_eq!(interpolate("${UNSET:-fallback}", &lookup).unwrap(), "fallback");
    }

    #[test]
    fn test_required_variable() {
        let lookup = env(&[]);
        let err = interpolate("${PORT:?port must be set}", &lookup).unwrap_err();
        assert_eq!(err.variable, "PORT");
        assert_eq!(err.message, "port must be set");
    }

    #[test]
    fn test_escaped_dollar() {
        let lookup = env(&[("HOME", "/root")]);
        assert_eq!(interpolate("$$HOME", &lookup).unwrap(), "$HOME");
    }

    #[test]
    fn test_literal_dollar_before_non_name() {
        let lookup = env(&[]);
        assert_eq!(interpolate("cost: $5", &lookup).unwrap(), "cost: $5");
    }

    #[test]
    fn test_tree_interpolation() {
        let lookup = env(&[("TAG", "1.2")]);
        let mut value: Value = serde_yaml::from_str("image: app:$TAG\nports:\n  - \"$TAG\"\n").unwrap();
        interpolate_tree(&mut value, &lookup).unwrap();
        assert_eq!(value["image"].as_str(), Some("app:1.2"));
        assert_eq!(value["ports"][0].as_str(), Some("1.2"));
    }
}
