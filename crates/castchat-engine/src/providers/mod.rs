pub mod chat;
pub mod image;

use std::collections::hash_map::DefaultHasher;
use std::env;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use castchat_contracts::chat::ChatTurn;
use castchat_contracts::providers::{NamedProvider, ProviderRegistry};
use reqwest::blocking::Response as HttpResponse;
use serde_json::{Map, Value};

use crate::config::EngineConfig;

pub use chat::{DryrunChatProvider, GrokProvider};
pub use image::{DryrunImageProvider, FluxProvider};

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatTurn>,
    /// Character biography, for services that take a persona separately.
    pub persona: Option<String>,
}

pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;
    fn complete(&self, request: &ChatRequest) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub prompt: String,
    pub seed: Option<i64>,
}

impl ImageRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            seed: None,
        }
    }
}

/// Returns the URL of the generated image.
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &ImageRequest) -> Result<String>;
}

impl NamedProvider for Box<dyn ChatProvider> {
    fn name(&self) -> &str {
        ChatProvider::name(self.as_ref())
    }
}

impl NamedProvider for Box<dyn ImageProvider> {
    fn name(&self) -> &str {
        ImageProvider::name(self.as_ref())
    }
}

pub fn chat_registry(config: &EngineConfig) -> ProviderRegistry<Box<dyn ChatProvider>> {
    let mut registry: ProviderRegistry<Box<dyn ChatProvider>> = ProviderRegistry::default();
    registry.register(Box::new(DryrunChatProvider));
    registry.register(Box::new(GrokProvider::new(
        &config.chat,
        config.request_timeout,
    )));
    registry
}

pub fn image_registry(config: &EngineConfig) -> ProviderRegistry<Box<dyn ImageProvider>> {
    let mut registry: ProviderRegistry<Box<dyn ImageProvider>> = ProviderRegistry::default();
    registry.register(Box::new(DryrunImageProvider::new(config.images_dir())));
    registry.register(Box::new(FluxProvider::new(
        &config.image,
        config.request_timeout,
    )));
    registry
}

pub fn build_chat_provider(config: &EngineConfig) -> Result<Box<dyn ChatProvider>> {
    chat_registry(config).into_provider(&config.chat.provider)
}

pub fn build_image_provider(config: &EngineConfig) -> Result<Box<dyn ImageProvider>> {
    image_registry(config).into_provider(&config.image.provider)
}

pub(crate) fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

/// Flattens an error chain into one line for logs and the journal.
pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub(crate) fn pseudo_random_seed() -> i64 {
    let mut hasher = DefaultHasher::new();
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    now_nanos.hash(&mut hasher);
    let raw = hasher.finish();
    (raw % 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use crate::config::EngineConfig;

    use super::{
        build_chat_provider, build_image_provider, chat_registry, error_chain_text,
        pseudo_random_seed, truncate_text, ChatProvider, ImageProvider,
    };

    #[test]
    fn registries_expose_dryrun_and_remote_providers() -> anyhow::Result<()> {
        let config = EngineConfig::default();
        assert_eq!(chat_registry(&config).list(), vec!["dryrun", "grok"]);
        assert_eq!(build_chat_provider(&config)?.name(), "dryrun");
        assert_eq!(build_image_provider(&config)?.name(), "dryrun");
        Ok(())
    }

    #[test]
    fn unknown_provider_name_is_an_error() {
        let mut config = EngineConfig::default();
        config.image.provider = "imagen".to_string();
        let err = build_image_provider(&config)
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert_eq!(err, "unknown provider 'imagen' (available: dryrun, flux)");
    }

    #[test]
    fn error_chain_text_joins_distinct_causes() {
        let err = anyhow!("connection reset").context("Grok request failed");
        assert_eq!(
            error_chain_text(&err, 200),
            "Grok request failed | caused by: connection reset"
        );
        assert_eq!(truncate_text("abcdef", 3), "abc…");
    }

    #[test]
    fn seeds_stay_in_range() {
        let seed = pseudo_random_seed();
        assert!((0..1_000_000).contains(&seed));
    }
}
