//! `${NAME}` placeholder resolution for tool arguments.
//!
//! Placeholders are resolved only when a call is handed to the browser.
//! Recorded steps and stored scripts keep the placeholder text.

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

/// Resolves `${NAME}` from a configured map, then from the environment.
#[derive(Clone, Default)]
pub struct SecretResolver {
    secrets: HashMap<String, String>,
    use_env: bool,
}

impl std::fmt::Debug for SecretResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.secrets.keys().collect();
        names.sort();
        f.debug_struct("SecretResolver")
            .field("names", &names)
            .field("use_env", &self.use_env)
            .finish()
    }
}

impl SecretResolver {
    /// Resolver backed by `secrets` and the process environment.
    pub fn new(secrets: HashMap<String, String>) -> Self {
        Self {
            secrets,
            use_env: true,
        }
    }

    /// Resolver that never consults the environment.
    pub fn without_env(secrets: HashMap<String, String>) -> Self {
        Self {
            secrets,
            use_env: false,
        }
    }

    fn lookup(&self, name: &str) -> Option<String> {
        if let Some(value) = self.secrets.get(name) {
            return Some(value.clone());
        }
        if self.use_env {
            return std::env::var(name).ok();
        }
        None
    }

    /// Replaces every `${NAME}` in `input`. Unknown names are left as written.
    pub fn resolve_str(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        for segment in placeholder_segments(input) {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Placeholder(name) => match self.lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        warn!(secret = name, "Secret placeholder has no value");
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                },
            }
        }
        out
    }

    /// Resolves placeholders in every string inside `value`.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.resolve_str(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// A piece of a string that may hold secret placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    /// Literal text, including malformed placeholders.
    Text(&'a str),
    /// Name inside a well-formed `${NAME}`.
    Placeholder(&'a str),
}

/// Splits `input` into literal text and well-formed `${NAME}` placeholders.
pub fn placeholder_segments(input: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut literal = 0;
    let mut cursor = 0;
    while let Some(offset) = input[cursor..].find("${") {
        let start = cursor + offset;
        let Some(len) = input[start + 2..].find('}') else {
            break;
        };
        let name = &input[start + 2..start + 2 + len];
        let end = start + 2 + len + 1;
        if is_placeholder_name(name) {
            if literal < start {
                out.push(Segment::Text(&input[literal..start]));
            }
            out.push(Segment::Placeholder(name));
            literal = end;
        }
        cursor = end;
    }
    if literal < input.len() {
        out.push(Segment::Text(&input[literal..]));
    }
    out
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn resolver() -> SecretResolver {
        SecretResolver::without_env(HashMap::from([
            ("LOGIN_EMAIL".to_string(), "ops@example.com".to_string()),
            ("PASSWORD".to_string(), "hunter2".to_string()),
        ]))
    }

    #[test]
    fn replaces_known_placeholders() {
        assert_eq!(resolver().resolve_str("${LOGIN_EMAIL}"), "ops@example.com");
        assert_eq!(
            resolver().resolve_str("user=${LOGIN_EMAIL} pw=${PASSWORD}!"),
            "user=ops@example.com pw=hunter2!"
        );
    }

    #[test]
    fn leaves_unknown_and_malformed_placeholders() {
        let r = resolver();
        assert_eq!(r.resolve_str("${MISSING}"), "${MISSING}");
        assert_eq!(r.resolve_str("price ${ not a name }"), "price ${ not a name }");
        assert_eq!(r.resolve_str("open ${PASSWORD"), "open ${PASSWORD");
        assert_eq!(r.resolve_str("plain text"), "plain text");
    }

    #[test]
    fn resolves_nested_values_without_touching_other_types() {
        let args = json!({
            "selector": "#email",
            "text": "${LOGIN_EMAIL}",
            "extra": [{"v": "${PASSWORD}"}, 3, true]
        });
        let resolved = resolver().resolve_value(&args);
        assert_eq!(resolved["text"], "ops@example.com");
        assert_eq!(resolved["extra"][0]["v"], "hunter2");
        assert_eq!(resolved["extra"][1], 3);
        assert_eq!(args["text"], "${LOGIN_EMAIL}");
    }

    #[test]
    fn segments_split_text_and_placeholders() {
        assert_eq!(
            placeholder_segments("user=${USER}; pw=${PASSWORD}"),
            vec![
                Segment::Text("user="),
                Segment::Placeholder("USER"),
                Segment::Text("; pw="),
                Segment::Placeholder("PASSWORD"),
            ]
        );
        assert_eq!(
            placeholder_segments("${bad-name} and ${open"),
            vec![Segment::Text("${bad-name} and ${open")]
        );
        assert!(placeholder_segments("").is_empty());
    }

    #[test]
    fn debug_output_hides_values() {
        let rendered = format!("{:?}", resolver());
        assert!(rendered.contains("LOGIN_EMAIL"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn configured_map_wins_over_environment() {
        let r = SecretResolver::new(HashMap::from([("PATH".to_string(), "shadowed".to_string())]));
        assert_eq!(r.resolve_str("${PATH}"), "shadowed");
    }
}
