//! Plan validation.
//!
//! Runs over the raw configuration before anything is compiled, so every
//! rejection names the offending step or field.

use crate::config::{build_capture, build_flags, normalize_url, PlanConfig};
use crate::data::DrawOrder;
use crate::error::PlanError;
use crate::expression;
use crate::faker::Registry;
use crate::inject::{dynamic_names, variable_names};
use crate::model::{HttpMethod, Sleep};
use std::collections::BTreeSet;
use url::Url;

/// Reject plans that cannot run.
pub fn validate(config: &PlanConfig, registry: &Registry) -> Result<(), PlanError> {
    validate_load(config)?;

    if config.steps.is_empty() {
        return Err(PlanError::invalid("plan has no steps"));
    }

    if let Some(proxy) = &config.proxy {
        let url =
            Url::parse(proxy).map_err(|e| PlanError::invalid(format!("proxy '{proxy}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(PlanError::invalid(format!(
                "proxy '{proxy}': scheme must be http or https"
            )));
        }
    }

    for (name, conf) in &config.data {
        if DrawOrder::parse(&conf.order).is_none() {
            return Err(PlanError::Data {
                source_name: name.clone(),
                message: format!("order must be sequential or random, got '{}'", conf.order),
            });
        }
        if let Some(key) = conf.vars.keys().find(|k| k.parse::<usize>().is_err()) {
            return Err(PlanError::Data {
                source_name: name.clone(),
                message: format!("column key '{key}' is not an index"),
            });
        }
    }

    for criteria in &config.success_criterias {
        expression::compile(&criteria.rule).map_err(|e| {
            PlanError::invalid(format!("success criteria '{}': {e}", criteria.rule))
        })?;
    }

    let mut declared: BTreeSet<String> = config.env.keys().cloned().collect();
    for (name, conf) in &config.data {
        for var in conf.vars.values() {
            declared.insert(format!("data.{}.{}", name, var.tag));
        }
    }

    let mut ids = BTreeSet::new();
    for step in &config.steps {
        let id = step.id;
        if id == 0 {
            return Err(PlanError::invalid("step id must be greater than zero"));
        }
        if !ids.insert(id) {
            return Err(PlanError::invalid(format!("duplicate step id {id}")));
        }

        step.method
            .parse::<HttpMethod>()
            .map_err(|e| PlanError::step(id, e))?;

        validate_url(id, &step.url)?;

        if step.timeout == 0 {
            return Err(PlanError::step(id, "timeout must be at least 1 second"));
        }

        if let Some(sleep) = step.sleep.as_deref().filter(|s| !s.trim().is_empty()) {
            Sleep::parse(sleep).map_err(|e| PlanError::step(id, e))?;
        }

        if let Some(auth) = &step.auth {
            if auth.kind != "basic" {
                return Err(PlanError::step(
                    id,
                    format!("unsupported auth type '{}'", auth.kind),
                ));
            }
        }

        if step.cert_path.is_some() != step.cert_key_path.is_some() {
            return Err(PlanError::step(
                id,
                "cert_path and cert_key_path must be given together",
            ));
        }

        build_flags(id, &step.others)?;

        // URL and header placeholders must resolve; payloads may go out
        // with literal placeholders.
        let mut referenced = variable_names(&step.url);
        for value in step.headers.values() {
            referenced.extend(variable_names(value));
        }
        for name in referenced {
            if !is_declared(&declared, &name) {
                return Err(PlanError::step(
                    id,
                    format!("'{{{{{name}}}}}' is not defined in env, data or an earlier capture"),
                ));
            }
        }

        let mut generators = dynamic_names(&step.url);
        for value in step.headers.values() {
            generators.extend(dynamic_names(value));
        }
        if let Some(payload) = &step.payload {
            generators.extend(dynamic_names(payload));
        }
        if let Some(name) = generators.iter().find(|g| !registry.contains(g)) {
            return Err(PlanError::step(id, format!("unknown generator '{name}'")));
        }

        for capture in &step.capture_env {
            build_capture(id, capture)?;
            declared.insert(capture.name.clone());
        }

        for assertion in &step.assertion {
            expression::compile(assertion.rule()).map_err(|e| {
                PlanError::step(id, format!("assertion '{}': {e}", assertion.rule()))
            })?;
        }
    }

    Ok(())
}

fn validate_load(config: &PlanConfig) -> Result<(), PlanError> {
    let (n, d) = config.totals();
    if n == 0 {
        return Err(PlanError::invalid("iteration_count must be at least 1"));
    }
    if d == 0 {
        return Err(PlanError::invalid("duration must be at least 1 second"));
    }

    if config.manual_load.is_empty() {
        return Ok(());
    }
    if config.manual_load.iter().any(|s| s.duration == 0) {
        return Err(PlanError::invalid(
            "manual_load segments need a duration of at least 1 second",
        ));
    }
    let count: u64 = config.manual_load.iter().map(|s| s.count).sum();
    let duration: u64 = config.manual_load.iter().map(|s| s.duration).sum();
    if count != n {
        return Err(PlanError::invalid(format!(
            "manual_load counts sum to {count}, iteration_count is {n}"
        )));
    }
    if duration != d {
        return Err(PlanError::invalid(format!(
            "manual_load durations sum to {duration}, duration is {d}"
        )));
    }
    Ok(())
}

fn validate_url(id: u32, raw: &str) -> Result<(), PlanError> {
    // Placeholders are swapped for a dummy value so templated URLs parse.
    let mut probe = raw.to_string();
    for name in variable_names(raw).into_iter().chain(dynamic_names(raw)) {
        probe = probe.replace(&format!("{{{{{name}}}}}"), "x");
    }
    let probe = if raw.starts_with("{{") {
        format!("http://{probe}")
    } else {
        normalize_url(&probe)
    };
    let url = Url::parse(&probe).map_err(|e| PlanError::step(id, format!("url '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(PlanError::step(
            id,
            format!("url '{raw}': scheme must be http or https"),
        ));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(PlanError::step(id, format!("url '{raw}' has no host")));
    }
    Ok(())
}

/// `name` is declared itself, or navigates into a declared value.
fn is_declared(declared: &BTreeSet<String>, name: &str) -> bool {
    if declared.contains(name) {
        return true;
    }
    name.match_indices('.')
        .any(|(idx, _)| declared.contains(&name[..idx]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(json: &str) -> Result<(), PlanError> {
        let config = PlanConfig::from_json(json).unwrap();
        validate(&config, &Registry::seeded(1))
    }

    fn plan_with_steps(steps: &str) -> String {
        format!(r#"{{"iteration_count": 10, "duration": 2, "steps": {steps}}}"#)
    }

    #[test]
    fn test_valid_plan() {
        let plan = plan_with_steps(
            r#"[{"id": 1, "url": "http://localhost/{{_guid}}", "sleep": "10-20"}]"#,
        );
        assert!(check(&plan).is_ok());
    }

    #[test]
    fn test_step_ids() {
        let zero = plan_with_steps(r#"[{"id": 0, "url": "http://localhost/"}]"#);
        assert!(check(&zero).is_err());
        let dup = plan_with_steps(
            r#"[{"id": 1, "url": "http://localhost/"}, {"id": 1, "url": "http://localhost/"}]"#,
        );
        assert!(check(&dup).unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_method_and_url() {
        let method = plan_with_steps(r#"[{"id": 1, "url": "http://localhost/", "method": "TRACE"}]"#);
        assert!(check(&method).is_err());
        let bare_host = plan_with_steps(r#"[{"id": 1, "url": "example.com/path"}]"#);
        assert!(check(&bare_host).is_ok());
        let scheme = plan_with_steps(r#"[{"id": 1, "url": "ftp://example.com/"}]"#);
        assert!(check(&scheme).is_err());
    }

    #[test]
    fn test_sleep_bounds() {
        let bad = plan_with_steps(r#"[{"id": 1, "url": "http://localhost/", "sleep": "500-100"}]"#);
        assert!(check(&bad).is_err());
        let long = plan_with_steps(r#"[{"id": 1, "url": "http://localhost/", "sleep": "70000"}]"#);
        assert!(check(&long).is_err());
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let zero = plan_with_steps(r#"[{"id": 1, "url": "http://localhost/", "timeout": 0}]"#);
        let err = check(&zero).unwrap_err().to_string();
        assert!(err.contains("timeout"), "{err}");
        let one = plan_with_steps(r#"[{"id": 1, "url": "http://localhost/", "timeout": 1}]"#);
        assert!(check(&one).is_ok());
    }

    #[test]
    fn test_undeclared_url_variable() {
        let plan = plan_with_steps(r#"[{"id": 1, "url": "http://localhost/{{missing}}"}]"#);
        let err = check(&plan).unwrap_err().to_string();
        assert!(err.contains("missing"), "{err}");
    }

    #[test]
    fn test_capture_declares_for_later_steps() {
        let plan = plan_with_steps(
            r#"[
                {"id": 1, "url": "http://localhost/v",
                 "capture_env": [{"as": "tok", "from": "body", "json_path": "token"}]},
                {"id": 2, "url": "http://localhost/o",
                 "headers": {"Authorization": "Bearer {{tok}}"}}
            ]"#,
        );
        assert!(check(&plan).is_ok());

        let reversed = plan_with_steps(
            r#"[
                {"id": 1, "url": "http://localhost/o",
                 "headers": {"Authorization": "Bearer {{tok}}"}},
                {"id": 2, "url": "http://localhost/v",
                 "capture_env": [{"as": "tok", "from": "body", "json_path": "token"}]}
            ]"#,
        );
        assert!(check(&reversed).is_err());
    }

    #[test]
    fn test_payload_variables_are_not_required() {
        let plan = plan_with_steps(
            r#"[{"id": 1, "url": "http://localhost/", "method": "POST", "payload": "\"{{who}}\""}]"#,
        );
        assert!(check(&plan).is_ok());
    }

    #[test]
    fn test_data_and_env_declarations() {
        let plan = r#"{
            "iteration_count": 1, "duration": 1,
            "env": {"user": {"id": 1}},
            "data": {"users": {"path": "u.csv", "order": "sequential",
                               "vars": {"0": {"tag": "email"}}}},
            "steps": [{"id": 1, "url": "http://localhost/{{user.id}}?e={{data.users.email}}"}]
        }"#;
        assert!(check(plan).is_ok());

        let bad_order = plan.replace("sequential", "shuffled");
        assert!(check(&bad_order).is_err());
    }

    #[test]
    fn test_unknown_generator() {
        let plan = plan_with_steps(r#"[{"id": 1, "url": "http://localhost/{{_nope}}"}]"#);
        assert!(check(&plan).unwrap_err().to_string().contains("_nope"));
    }

    #[test]
    fn test_manual_load_rules() {
        let zero = r#"{"manual_load": [{"duration": 0, "count": 5}],
                       "steps": [{"id": 1, "url": "http://localhost/"}]}"#;
        assert!(check(zero).is_err());
        let mismatch = r#"{"iteration_count": 9, "manual_load": [{"duration": 1, "count": 5}],
                           "steps": [{"id": 1, "url": "http://localhost/"}]}"#;
        assert!(check(mismatch).is_err());
    }

    #[test]
    fn test_bad_assertion_is_rejected() {
        let plan = plan_with_steps(
            r#"[{"id": 1, "url": "http://localhost/", "assertion": ["status_code =="]}]"#,
        );
        assert!(check(&plan).is_err());
    }
}
