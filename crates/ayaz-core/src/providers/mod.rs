//! LLM backends
//!
//! Supports IBM watsonx.ai and Google Gemini. Providers implement the
//! [`LlmProvider`] trait and are wrapped in a [`ModelRouter`] for retries.

pub mod google;
pub mod router;
pub mod types;
pub mod watsonx;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::settings::ProviderSettings;

pub use google::GoogleProvider;
pub use router::ModelRouter;
pub use types::{ChatMessage, ChatResponse, ChatRole, ChatUsage, LlmProvider, StopReason};
pub use watsonx::WatsonxProvider;

/// Request limits shared by every backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderOptions {
    pub max_tokens: u32,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            timeout: Duration::from_secs(120),
            max_retries: 3,
        }
    }
}

/// Build the provider for `settings`, wrapped in a retrying router
pub fn build_provider(
    settings: &ProviderSettings,
    options: ProviderOptions,
) -> Result<Arc<dyn LlmProvider>> {
    build_failover_provider(std::slice::from_ref(settings), options)
}

/// Build a router over `chain`; later entries are tried when earlier ones fail
pub fn build_failover_provider(
    chain: &[ProviderSettings],
    options: ProviderOptions,
) -> Result<Arc<dyn LlmProvider>> {
    let mut providers = chain
        .iter()
        .map(|settings| backend_provider(settings, options))
        .collect::<Result<Vec<_>>>()?;

    let router = if providers.len() == 1 {
        ModelRouter::single(providers.remove(0))
    } else {
        ModelRouter::with_failover(providers)?
    };
    Ok(Arc::new(router.with_max_retries(options.max_retries)))
}

fn backend_provider(
    settings: &ProviderSettings,
    options: ProviderOptions,
) -> Result<Box<dyn LlmProvider>> {
    let provider: Box<dyn LlmProvider> = match settings {
        ProviderSettings::Watsonx {
            model,
            url,
            api_key,
            project_id,
        } => Box::new(WatsonxProvider::new(
            api_key.clone(),
            url.clone(),
            project_id.clone(),
            model.clone(),
            options.max_tokens,
            options.timeout,
        )?),
        ProviderSettings::Gemini { model, api_key } => Box::new(GoogleProvider::new(
            api_key.clone(),
            model.clone(),
            options.max_tokens,
            options.timeout,
        )?),
    };

    info!(
        "LLM provider initialized ({}: {}, max_tokens={}, retries={})",
        provider.provider_name(),
        provider.model(),
        options.max_tokens,
        options.max_retries
    );
    Ok(provider)
}
