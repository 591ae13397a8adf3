//! Workflow inputs — credentials, the requested action, and template interpolation

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::settings::mask_secret;

/// Placeholder used when the user gives no extra context
pub const NO_CONTEXT: &str = "No additional context provided.";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("invalid email address '{0}': it must contain '@' and '.'")]
    InvalidEmail(String),
    #[error("missing template variable '{variable}' in: {template}")]
    MissingVariable { variable: String, template: String },
}

/// Credentials collected at the start of a workflow. Held only for one run.
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub auth_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("auth_token", &mask_secret(&self.auth_token))
            .finish()
    }
}

/// Accept an email iff it contains both '@' and '.'
pub fn validate_email(email: &str) -> Result<(), InputError> {
    let email = email.trim();
    if email.contains('@') && email.contains('.') {
        Ok(())
    } else {
        Err(InputError::InvalidEmail(email.to_string()))
    }
}

/// Named values interpolated into agent and task definitions
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowInputs(BTreeMap<String, String>);

impl WorkflowInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the standard inputs for a workflow run
    pub fn for_workflow(
        credentials: &Credentials,
        action: &str,
        context: Option<&str>,
        current_year: i32,
    ) -> Self {
        let context = context
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(NO_CONTEXT);

        let mut inputs = Self::new();
        inputs.insert("current_year", current_year.to_string());
        inputs.insert("action", action.trim());
        inputs.insert("user_email", credentials.email.trim());
        inputs.insert("auth_token", credentials.auth_token.clone());
        inputs.insert("context", context);
        inputs
    }

    /// Inputs entered for a replay. A skipped context is left out so the
    /// stored one survives the merge.
    pub fn replay_overrides(
        credentials: &Credentials,
        action: &str,
        context: Option<&str>,
        current_year: i32,
    ) -> Self {
        let inputs = Self::for_workflow(credentials, action, context, current_year);
        match context.map(str::trim) {
            Some(c) if !c.is_empty() => inputs,
            _ => inputs.without("context"),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy of these inputs with `key` removed
    pub fn without(&self, key: &str) -> Self {
        let mut copy = self.clone();
        copy.0.remove(key);
        copy
    }

    /// Overlay `other` on top of these inputs; values in `other` win
    pub fn merge(&mut self, other: &WorkflowInputs) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }
}

impl std::fmt::Debug for WorkflowInputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in &self.0 {
            if k == "auth_token" {
                map.entry(k, &mask_secret(v));
            } else {
                map.entry(k, v);
            }
        }
        map.finish()
    }
}

/// Replace `{name}` placeholders with values from `inputs`.
///
/// Only `{identifier}` sequences count as placeholders, so literal braces in
/// prompts (JSON samples and the like) pass through untouched.
pub fn interpolate(template: &str, inputs: &WorkflowInputs) -> Result<String, InputError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        match after.find('}') {
            Some(close) if is_identifier(&after[..close]) => {
                let name = &after[..close];
                let value = inputs.get(name).ok_or_else(|| InputError::MissingVariable {
                    variable: name.to_string(),
                    template: template.to_string(),
                })?;
                out.push_str(value);
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
