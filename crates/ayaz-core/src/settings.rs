//! LLM backend selection and credential loading from the environment

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which LLM backend the crew talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Watsonx,
    Gemini,
}

impl Backend {
    pub const ALL: [Backend; 2] = [Backend::Watsonx, Backend::Gemini];

    /// Environment variables that must be set for this backend
    pub fn required_vars(self) -> &'static [&'static str] {
        match self {
            Self::Watsonx => &["MODEL", "WATSONX_URL", "WATSONX_APIKEY", "WATSONX_PROJECT_ID"],
            Self::Gemini => &["MODEL", "GOOGLE_API_KEY"],
        }
    }

    /// Routing prefix a `MODEL` value may carry (e.g. `watsonx/ibm/granite-13b-chat-v2`)
    fn model_prefix(self) -> &'static str {
        match self {
            Self::Watsonx => "watsonx/",
            Self::Gemini => "gemini/",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Watsonx => write!(f, "watsonx"),
            Self::Gemini => write!(f, "gemini"),
        }
    }
}

impl FromStr for Backend {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "watsonx" | "ibm" => Ok(Self::Watsonx),
            "gemini" | "google" => Ok(Self::Gemini),
            other => Err(SettingsError::UnknownBackend(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("missing required environment variable(s) for {backend} backend: {}", .vars.join(", "))]
    MissingEnv {
        backend: Backend,
        vars: Vec<&'static str>,
    },
    #[error("unknown LLM backend '{0}' (expected 'watsonx' or 'gemini')")]
    UnknownBackend(String),
    #[error("model '{model}' is meant for the {owner} backend, but the {backend} backend is selected")]
    ForeignModel {
        model: String,
        owner: Backend,
        backend: Backend,
    },
}

/// Credentials and model for the selected backend
#[derive(Clone, PartialEq, Eq)]
pub enum ProviderSettings {
    Watsonx {
        model: String,
        url: String,
        api_key: String,
        project_id: String,
    },
    Gemini {
        model: String,
        api_key: String,
    },
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Watsonx {
                model,
                url,
                api_key,
                project_id,
            } => f
                .debug_struct("Watsonx")
                .field("model", model)
                .field("url", url)
                .field("api_key", &mask_secret(api_key))
                .field("project_id", project_id)
                .finish(),
            Self::Gemini { model, api_key } => f
                .debug_struct("Gemini")
                .field("model", model)
                .field("api_key", &mask_secret(api_key))
                .finish(),
        }
    }
}

impl ProviderSettings {
    /// Read the backend's variables from the process environment
    pub fn from_env(backend: Backend) -> Result<Self, SettingsError> {
        Self::from_lookup(backend, |name| std::env::var(name).ok())
    }

    /// Read the backend's variables through `lookup`. Blank values count as unset.
    /// Every missing variable is reported, not just the first.
    pub fn from_lookup<F>(backend: Backend, lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let missing: Vec<&'static str> = backend
            .required_vars()
            .iter()
            .copied()
            .filter(|name| read(*name).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(SettingsError::MissingEnv {
                backend,
                vars: missing,
            });
        }

        let get = |name: &str| read(name).unwrap_or_default().trim().to_string();
        let model = strip_model_prefix(&get("MODEL"), backend);

        Ok(match backend {
            Backend::Watsonx => Self::Watsonx {
                model,
                url: get("WATSONX_URL").trim_end_matches('/').to_string(),
                api_key: get("WATSONX_APIKEY"),
                project_id: get("WATSONX_PROJECT_ID"),
            },
            Backend::Gemini => Self::Gemini {
                model,
                api_key: get("GOOGLE_API_KEY"),
            },
        })
    }

    pub fn backend(&self) -> Backend {
        match self {
            Self::Watsonx { .. } => Backend::Watsonx,
            Self::Gemini { .. } => Backend::Gemini,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            Self::Watsonx { model, .. } | Self::Gemini { model, .. } => model,
        }
    }

    /// Same credentials, different model. A model routed to another backend
    /// (`gemini/...` while on watsonx) is rejected.
    pub fn with_model(&self, model: &str) -> Result<Self, SettingsError> {
        let backend = self.backend();
        if let Some(owner) = Backend::ALL
            .into_iter()
            .find(|b| *b != backend && model.trim().starts_with(b.model_prefix()))
        {
            return Err(SettingsError::ForeignModel {
                model: model.trim().to_string(),
                owner,
                backend,
            });
        }

        let model = strip_model_prefix(model, backend);
        let mut settings = self.clone();
        match &mut settings {
            Self::Watsonx { model: m, .. } | Self::Gemini { model: m, .. } => *m = model,
        }
        Ok(settings)
    }
}

fn strip_model_prefix(model: &str, backend: Backend) -> String {
    let model = model.trim();
    model
        .strip_prefix(backend.model_prefix())
        .unwrap_or(model)
        .to_string()
}

/// Mask a secret for Debug output and logs.
/// Shows the first 3 and last 4 chars of keys longer than 7 chars, otherwise "***".
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}
