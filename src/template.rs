//! Command template parsing
//!
//! Turns a template such as `{{binary}} -p "{{prompt}}" --model {{model}}`
//! plus a value map into an argv vector. No shell is ever involved: the
//! substituted string is tokenized with shell-style quoting rules only so
//! that a quoted placeholder stays a single argument.

use crate::error::TemplateError;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// Values available to a template, keyed by placeholder name
pub type TemplateContext = BTreeMap<String, String>;

/// Placeholders every adapter supplies
pub const STANDARD_PLACEHOLDERS: &[&str] = &["binary", "model", "prompt"];

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^{}]*)\}\}").expect("static regex"))
}

/// Quoting state of the template at a given byte offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quoting {
    None,
    Single,
    Double,
}

/// Parser for command templates
#[derive(Debug, Clone, Default)]
pub struct TemplateParser {
    allowed: Option<BTreeSet<String>>,
}

impl TemplateParser {
    /// Parser accepting any placeholder name
    pub fn new() -> Self {
        Self::default()
    }

    /// Parser that rejects placeholders outside `names`
    pub fn with_allowed<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: Some(names.into_iter().map(Into::into).collect()),
        }
    }

    /// Parser restricted to `binary`, `model` and `prompt`
    pub fn standard() -> Self {
        Self::with_allowed(STANDARD_PLACEHOLDERS.iter().copied())
    }

    /// Build an argv from `template` and `context`
    pub fn parse(&self, template: &str, context: &TemplateContext) -> Result<Vec<String>, TemplateError> {
        check_braces(template)?;
        let names = self.checked_placeholders(template)?;

        let missing: Vec<&str> = names
            .iter()
            .filter(|n| !context.contains_key(n.as_str()))
            .map(|n| n.as_str())
            .collect();
        if !missing.is_empty() {
            let mut available: Vec<&str> = context.keys().map(|k| k.as_str()).collect();
            available.sort_unstable();
            return Err(TemplateError::Placeholder {
                message: format!(
                    "no value for placeholder(s) {}; available: {}",
                    missing.join(", "),
                    available.join(", ")
                ),
            });
        }

        let substituted = substitute(template, context);
        shlex::split(&substituted).ok_or_else(|| TemplateError::Syntax {
            template: template.to_string(),
            message: "unbalanced quotes after substitution".to_string(),
        })
    }

    /// Placeholder names referenced by `template`, in order of first use
    pub fn placeholders(&self, template: &str) -> Result<Vec<String>, TemplateError> {
        check_braces(template)?;
        self.checked_placeholders(template)
    }

    fn checked_placeholders(&self, template: &str) -> Result<Vec<String>, TemplateError> {
        let mut names: Vec<String> = Vec::new();
        for cap in placeholder_regex().captures_iter(template) {
            let name = cap[1].trim();
            if name.is_empty() {
                return Err(TemplateError::Syntax {
                    template: template.to_string(),
                    message: "empty placeholder name".to_string(),
                });
            }
            if let Some(allowed) = &self.allowed {
                if !allowed.contains(name) {
                    let allowed: Vec<&str> = allowed.iter().map(|s| s.as_str()).collect();
                    return Err(TemplateError::Placeholder {
                        message: format!(
                            "placeholder '{}' is not allowed; allowed: {}",
                            name,
                            allowed.join(", ")
                        ),
                    });
                }
            }
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

/// Reject nested, stray or unterminated placeholder braces
fn check_braces(template: &str) -> Result<(), TemplateError> {
    let syntax = |message: &str| TemplateError::Syntax {
        template: template.to_string(),
        message: message.to_string(),
    };

    let bytes = template.as_bytes();
    let mut open = false;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i..].starts_with(b"{{") {
            if open {
                return Err(syntax("nested '{{' inside a placeholder"));
            }
            open = true;
            i += 2;
        } else if bytes[i..].starts_with(b"}}") {
            if !open {
                return Err(syntax("'}}' without a matching '{{'"));
            }
            open = false;
            i += 2;
        } else {
            i += 1;
        }
    }
    if open {
        return Err(syntax("unterminated '{{'"));
    }
    Ok(())
}

/// Replace each placeholder with its escaped value
fn substitute(template: &str, context: &TemplateContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for cap in placeholder_regex().captures_iter(template) {
        let whole = cap.get(0).expect("capture 0 always present");
        let literal = &template[last..whole.start()];
        out.push_str(literal);

        let name = cap[1].trim();
        let value = context.get(name).map(|s| s.as_str()).unwrap_or_default();
        let quoting = quoting_at(template, whole.start());
        out.push_str(&escape_value(value, quoting));
        last = whole.end();
    }
    out.push_str(&template[last..]);
    out
}

/// Quoting state of the template's literal text before `offset`
fn quoting_at(template: &str, offset: usize) -> Quoting {
    let mut state = Quoting::None;
    let mut escaped = false;
    let prefix = placeholder_regex().replace_all(&template[..offset], "");
    for c in prefix.chars() {
        match state {
            Quoting::None => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '\'' {
                    state = Quoting::Single;
                } else if c == '"' {
                    state = Quoting::Double;
                }
            }
            Quoting::Single => {
                if c == '\'' {
                    state = Quoting::None;
                }
            }
            Quoting::Double => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    state = Quoting::None;
                }
            }
        }
    }
    state
}

/// Strip NUL bytes and escape quotes so the value cannot end its quoting
fn escape_value(value: &str, quoting: Quoting) -> String {
    let cleaned: String = value.chars().filter(|&c| c != '\0').collect();
    let mut out = String::with_capacity(cleaned.len() + 8);
    match quoting {
        Quoting::Double => {
            for c in cleaned.chars() {
                if c == '"' || c == '\\' {
                    out.push('\\');
                }
                out.push(c);
            }
        }
        Quoting::Single => {
            for c in cleaned.chars() {
                if c == '\'' {
                    out.push_str("'\\''");
                } else {
                    out.push(c);
                }
            }
        }
        Quoting::None => {
            for c in cleaned.chars() {
                if c == '"' || c == '\'' || c == '\\' || c == '#' {
                    out.push('\\');
                }
                out.push(c);
            }
        }
    }
    out
}
