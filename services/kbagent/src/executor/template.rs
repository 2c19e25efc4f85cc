//! `{{ .NAME }}` placeholder rendering.

use std::collections::HashMap;
use std::sync::LazyLock;

use kbagent_proto::ActionError;
use regex::Regex;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder pattern is valid")
});

/// Renders `text`, resolving each placeholder from `parameters` and then from
/// the process environment.
///
/// A placeholder with no value, or any other `{{ ... }}` expression, is a
/// bad request.
pub fn render_template(
    what: &str,
    text: &str,
    parameters: &HashMap<String, String>,
) -> Result<String, ActionError> {
    render_with(what, text, |key| {
        parameters
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
    })
}

fn render_with<F>(what: &str, text: &str, lookup: F) -> Result<String, ActionError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(text) {
        let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        push_literal(what, &mut out, &text[last..whole.start()])?;
        let value = lookup(key.as_str()).ok_or_else(|| {
            ActionError::bad_request(format!(
                "failed to render {what}: map has no entry for key \"{}\"",
                key.as_str()
            ))
        })?;
        out.push_str(&value);
        last = whole.end();
    }
    push_literal(what, &mut out, &text[last..])?;
    Ok(out)
}

fn push_literal(what: &str, out: &mut String, literal: &str) -> Result<(), ActionError> {
    if literal.contains("{{") {
        return Err(ActionError::bad_request(format!(
            "failed to render {what}: unsupported template expression"
        )));
    }
    out.push_str(literal);
    Ok(())
}
