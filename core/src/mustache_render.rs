//! Two mustache render modes (§9 design notes): `Strict` errors on a missing
//! key (used for label/build-arg rendering), `Tolerant` logs and leaves the
//! placeholder untouched (used for per-service env rendering). The upstream
//! source mixes these; this crate keeps them distinct on purpose.

use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Strict,
    Tolerant,
}

pub fn render(template: &str, context: &Value, mode: RenderMode) -> Result<String> {
    let vars = extract_variables(template);
    let mut missing = Vec::new();
    for var in &vars {
        if resolve_path(context, var).is_none() {
            missing.push(var.clone());
        }
    }

    if mode == RenderMode::Strict && !missing.is_empty() {
        return Err(Error::Validation(previewctl_types::ProjectValidationError {
            kind: "missing-template-variable".to_string(),
            message: format!("undefined variable(s): {}", missing.join(", ")),
        }));
    }

    if mode == RenderMode::Tolerant && !missing.is_empty() {
        tracing::warn!(?missing, "mustache placeholder left unresolved");
    }

    let compiled = mustache::compile_str(template)
        .map_err(|e| Error::Transient(anyhow::anyhow!("invalid mustache template: {e}")))?;
    compiled
        .render_to_string(context)
        .map_err(|e| Error::Transient(anyhow::anyhow!("mustache render failed: {e}")))
}

/// Extracts `{{var}}`/`{{{var}}}` variable names, skipping section/partial/comment
/// tags (`#`, `/`, `^`, `!`, `>`). Not a full mustache parser, just enough to
/// tell which plain substitutions a template references.
fn extract_variables(template: &str) -> Vec<String> {
    let mut vars = Vec::new();
    let bytes = template.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'{' && bytes[i + 1] == b'{' {
            let start = i + 2;
            if let Some(end_rel) = template[start..].find("}}") {
                let end = start + end_rel;
                let mut inner = &template[start..end];
                if let Some(stripped) = inner.strip_prefix('{')
                    && let Some(closing) = template.get(end..end + 1)
                    && closing == "}"
                {
                    inner = stripped;
                }
                let inner = inner.trim();
                if !inner.is_empty()
                    && !matches!(inner.chars().next(), Some('#' | '/' | '^' | '!' | '>' | '&'))
                {
                    vars.push(inner.to_string());
                }
                i = end + 2;
                continue;
            }
        }
        i += 1;
    }
    vars
}

fn resolve_path<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strict_mode_errors_on_missing_variable() {
        let ctx = json!({ "owner": "acme" });
        let err = render("hello {{owner}}/{{repo}}", &ctx, RenderMode::Strict).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn strict_mode_succeeds_when_all_present() {
        let ctx = json!({ "owner": "acme", "repo": "demo" });
        let out = render("hello {{owner}}/{{repo}}", &ctx, RenderMode::Strict).unwrap();
        assert_eq!(out, "hello acme/demo");
    }

    #[test]
    fn tolerant_mode_does_not_error_on_missing_variable() {
        let ctx = json!({ "owner": "acme" });
        let out = render("hello {{owner}}/{{missing}}", &ctx, RenderMode::Tolerant).unwrap();
        assert_eq!(out, "hello acme/");
    }

    #[test]
    fn nested_path_resolves() {
        let ctx = json!({ "services": { "web": { "url": "web.example.com" } } });
        let out = render("{{services.web.url}}", &ctx, RenderMode::Strict).unwrap();
        assert_eq!(out, "web.example.com");
    }
}
