//! `{{name}}` and `{{_generator}}` substitution.
//!
//! Both forms are JSON aware: when the whole text is a valid JSON document,
//! a placeholder that is the entire string literal (`"{{id}}"`) is replaced
//! by the JSON form of the value, so numbers, objects and booleans keep
//! their type. Placeholders inside a longer literal get the JSON-escaped
//! string form.

use crate::env::Env;
use crate::faker::Registry;
use crate::value::Value;
use regex::{Captures, Regex};
use std::sync::{Arc, LazyLock};

static VARIABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""?\{\{([A-Za-z$][A-Za-z0-9_().\-]*)\}\}"?"#)
        .expect("failed to compile variable regex")
});

static DYNAMIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""?\{\{(_[A-Za-z0-9_]+)\}\}"?"#).expect("failed to compile dynamic regex")
});

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InjectError {
    #[error("keys not found: {}", .0.join(", "))]
    KeyNotFound(Vec<String>),
}

impl InjectError {
    pub fn keys(&self) -> &[String] {
        match self {
            InjectError::KeyNotFound(keys) => keys,
        }
    }
}

/// Names of every `{{name}}` variable referenced by `text`.
pub fn variable_names(text: &str) -> Vec<String> {
    VARIABLE_RE
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect()
}

/// Names of every `{{_generator}}` referenced by `text`.
pub fn dynamic_names(text: &str) -> Vec<String> {
    DYNAMIC_RE
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect()
}

#[derive(Debug, Clone)]
pub struct Injector {
    registry: Arc<Registry>,
}

impl Injector {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Apply dynamic then variable injection. On any miss the original text
    /// is returned inside the error path, untouched, so callers can decide
    /// whether to send it literally.
    pub fn inject(&self, text: &str, env: &Env) -> Result<String, InjectError> {
        if !text.contains("{{") {
            return Ok(text.to_string());
        }
        let json_mode = serde_json::from_str::<serde_json::Value>(text).is_ok();
        let mut missing = Vec::new();

        let generated = replace(&DYNAMIC_RE, text, json_mode, &mut missing, |name| {
            self.registry.generate(name)
        });
        let injected = replace(&VARIABLE_RE, &generated, json_mode, &mut missing, |name| {
            env.get(name).cloned()
        });

        if missing.is_empty() {
            Ok(injected)
        } else {
            Err(InjectError::KeyNotFound(missing))
        }
    }

    /// Inject into `text`, falling back to the original on a miss. The
    /// missing keys are appended to `missing`.
    pub fn inject_or_keep(&self, text: &str, env: &Env, missing: &mut Vec<String>) -> String {
        match self.inject(text, env) {
            Ok(out) => out,
            Err(err) => {
                missing.extend(err.keys().iter().cloned());
                text.to_string()
            }
        }
    }
}

fn replace(
    re: &Regex,
    text: &str,
    json_mode: bool,
    missing: &mut Vec<String>,
    mut resolve: impl FnMut(&str) -> Option<Value>,
) -> String {
    re.replace_all(text, |caps: &Captures| {
        let whole = &caps[0];
        let name = &caps[1];
        let lead = whole.starts_with('"');
        let trail = whole.len() > 1 && whole.ends_with('"') && !whole.ends_with("}}");

        let Some(value) = resolve(name) else {
            if !missing.iter().any(|m| m == name) {
                missing.push(name.to_string());
            }
            return whole.to_string();
        };

        if json_mode && lead && trail {
            return value.to_json_string();
        }
        let text = if json_mode {
            json_escape(&value.to_string())
        } else {
            value.to_string()
        };
        format!(
            "{}{}{}",
            if lead { "\"" } else { "" },
            text,
            if trail { "\"" } else { "" }
        )
    })
    .into_owned()
}

fn json_escape(text: &str) -> String {
    let quoted = serde_json::Value::String(text.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn injector() -> Injector {
        Injector::new(Arc::new(Registry::seeded(11)))
    }

    fn env(pairs: &[(&str, Value)]) -> Env {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_plain_text_is_untouched() {
        let inj = injector();
        let text = "GET /plain path with {single} braces";
        let once = inj.inject(text, &Env::new()).unwrap();
        let twice = inj.inject(&once, &Env::new()).unwrap();
        assert_eq!(once, text);
        assert_eq!(twice, text);
    }

    #[test]
    fn test_string_injection() {
        let inj = injector();
        let e = env(&[("tok", Value::from("t-42")), ("n", Value::Int(7))]);
        assert_eq!(inj.inject("Bearer {{tok}}", &e).unwrap(), "Bearer t-42");
        assert_eq!(
            inj.inject("http://h/{{n}}/x?f={{tok}}", &e).unwrap(),
            "http://h/7/x?f=t-42"
        );
    }

    #[test]
    fn test_json_keeps_types() {
        let inj = injector();
        let e = env(&[
            ("id", Value::Int(5)),
            ("obj", Value::from_json(json!({"a": [1, true]}))),
            ("name", Value::from("say \"hi\"")),
        ]);
        let out = inj
            .inject(r#"{"id": "{{id}}", "o": "{{obj}}", "msg": "hello {{name}}"}"#, &e)
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["id"], json!(5));
        assert_eq!(parsed["o"], json!({"a": [1, true]}));
        assert_eq!(parsed["msg"], json!("hello say \"hi\""));
    }

    #[test]
    fn test_missing_key_returns_error_with_names() {
        let inj = injector();
        let err = inj.inject(r#""{{who}}""#, &Env::new()).unwrap_err();
        assert_eq!(err.keys(), ["who".to_string()]);

        let mut missing = Vec::new();
        let kept = inj.inject_or_keep(r#""{{who}}""#, &Env::new(), &mut missing);
        assert_eq!(kept, r#""{{who}}""#);
        assert_eq!(missing, vec!["who".to_string()]);
    }

    #[test]
    fn test_dynamic_injection() {
        let inj = injector();
        let out = inj.inject(r#"{"n": "{{_randomInt}}"}"#, &Env::new()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert!(parsed["n"].is_i64());

        let out = inj.inject("id-{{_guid}}", &Env::new()).unwrap();
        assert!(uuid::Uuid::parse_str(out.trim_start_matches("id-")).is_ok());

        assert!(inj.inject("{{_doesNotExist}}", &Env::new()).is_err());
    }

    #[test]
    fn test_placeholder_names() {
        assert_eq!(
            variable_names("{{a}}/{{data.users.email}}/{{_guid}}"),
            vec!["a".to_string(), "data.users.email".to_string()]
        );
        assert_eq!(dynamic_names("{{a}} {{_guid}}"), vec!["_guid".to_string()]);
    }
}
