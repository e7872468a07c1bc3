//! Completion provider implementations for Homunculus.
//!
//! All providers implement the `homunculus_core::Provider` trait.
//! [`build_provider`] selects one from the `[model]` configuration.

pub mod anthropic;
pub mod openai_compat;

pub use anthropic::AnthropicProvider;
pub use openai_compat::OpenAiCompatProvider;

use homunculus_config::ModelConfig;
use homunculus_core::error::ProviderError;
use homunculus_core::Provider;
use std::sync::Arc;

const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Build the configured provider. The API key must already be resolved.
pub fn build_provider(model: &ModelConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let api_key = model
        .api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| {
            ProviderError::NotConfigured(format!("{} is not set", model.api_key_env))
        })?;

    match model.provider.trim().to_ascii_lowercase().as_str() {
        "anthropic" => {
            let mut provider = AnthropicProvider::new(api_key, model.timeout())?;
            if let Some(ref url) = model.base_url {
                provider = provider.with_base_url(url.as_str());
            }
            Ok(Arc::new(provider))
        }
        "openai" => {
            let provider = match model.base_url {
                Some(ref url) => OpenAiCompatProvider::new("openai", url.as_str(), api_key, model.timeout())?,
                None => OpenAiCompatProvider::openai(api_key, model.timeout())?,
            };
            Ok(Arc::new(provider))
        }
        other => Err(ProviderError::NotConfigured(format!(
            "unknown provider '{other}'"
        ))),
    }
}

pub(crate) fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Network(e.to_string())
    }
}

pub(crate) fn retry_after(headers: &reqwest::header::HeaderMap) -> u64 {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}
