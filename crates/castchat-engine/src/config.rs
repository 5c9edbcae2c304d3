use std::path::PathBuf;
use std::time::Duration;

use castchat_contracts::storage::LoadPolicy;

use crate::providers::non_empty_env;

pub const DEFAULT_DATA_DIR: &str = ".castchat";
pub const DEFAULT_CHAT_API_BASE: &str = "https://api.x.ai/v1";
pub const DEFAULT_CHAT_MODEL: &str = "grok-beta";
pub const DEFAULT_IMAGE_API_BASE: &str = "https://api.bfl.ai/v1";
pub const DEFAULT_IMAGE_MODEL: &str = "flux-pro-1.1";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: f64 = 60.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    pub provider: String,
    pub model: String,
    pub api_base: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageConfig {
    pub provider: String,
    pub model: String,
    pub api_base: String,
    pub api_key: Option<String>,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RosterConfig {
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub roster_file: Option<PathBuf>,
    pub store_image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub chat: ChatConfig,
    pub image: ImageConfig,
    pub roster: RosterConfig,
    pub request_timeout: Duration,
    pub load_policy: LoadPolicy,
    pub events_path: Option<PathBuf>,
    pub generate_portraits: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            chat: ChatConfig {
                provider: "dryrun".to_string(),
                model: DEFAULT_CHAT_MODEL.to_string(),
                api_base: DEFAULT_CHAT_API_BASE.to_string(),
                api_key: None,
            },
            image: ImageConfig {
                provider: "dryrun".to_string(),
                model: DEFAULT_IMAGE_MODEL.to_string(),
                api_base: DEFAULT_IMAGE_API_BASE.to_string(),
                api_key: None,
                poll_interval: Duration::from_millis(500),
                poll_timeout: Duration::from_secs(120),
            },
            roster: RosterConfig::default(),
            request_timeout: Duration::from_secs_f64(DEFAULT_REQUEST_TIMEOUT_SECS),
            load_policy: LoadPolicy::Reset,
            events_path: None,
            generate_portraits: true,
        }
    }
}

impl EngineConfig {
    /// Reads settings from the environment. Remote providers are chosen
    /// only when their key is present.
    pub fn from_env() -> Self {
        Self::from_lookup(non_empty_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup("CASTCHAT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        config.chat.api_key = lookup("XAI_API_KEY").or_else(|| lookup("GROK_API_KEY"));
        config.chat.provider = lookup("CASTCHAT_CHAT_PROVIDER").unwrap_or_else(|| {
            if config.chat.api_key.is_some() {
                "grok".to_string()
            } else {
                "dryrun".to_string()
            }
        });
        if let Some(model) = lookup("CASTCHAT_CHAT_MODEL") {
            config.chat.model = model;
        }
        if let Some(base) = lookup("XAI_API_BASE") {
            config.chat.api_base = base.trim_end_matches('/').to_string();
        }

        config.image.api_key = lookup("BFL_API_KEY").or_else(|| lookup("FLUX_API_KEY"));
        config.image.provider = lookup("CASTCHAT_IMAGE_PROVIDER").unwrap_or_else(|| {
            if config.image.api_key.is_some() {
                "flux".to_string()
            } else {
                "dryrun".to_string()
            }
        });
        // Portraits are generated only when an image key is configured.
        config.generate_portraits = config.image.api_key.is_some();
        if let Some(model) = lookup("CASTCHAT_IMAGE_MODEL") {
            config.image.model = model;
        }
        if let Some(base) = lookup("FLUX_API_BASE") {
            config.image.api_base = base.trim_end_matches('/').to_string();
        }

        config.roster = RosterConfig {
            supabase_url: lookup("SUPABASE_URL").map(|url| url.trim_end_matches('/').to_string()),
            supabase_key: lookup("SUPABASE_ANON_KEY").or_else(|| lookup("SUPABASE_KEY")),
            roster_file: lookup("CASTCHAT_ROSTER_FILE").map(PathBuf::from),
            store_image_url: lookup("CASTCHAT_STORE_IMAGE_URL"),
        };

        if let Some(seconds) = lookup("CASTCHAT_REQUEST_TIMEOUT")
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|value| value.is_finite() && *value > 0.0)
        {
            config.request_timeout = Duration::from_secs_f64(seconds.clamp(1.0, 600.0));
        }
        config
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    use super::EngineConfig;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_to_dryrun_without_keys() {
        let config = EngineConfig::from_lookup(lookup_from(&[]));
        assert_eq!(config.chat.provider, "dryrun");
        assert_eq!(config.image.provider, "dryrun");
        assert_eq!(config.data_dir, PathBuf::from(".castchat"));
        assert_eq!(config.state_dir(), PathBuf::from(".castchat/state"));
        assert!(!config.generate_portraits);
    }

    #[test]
    fn keys_select_remote_providers() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("GROK_API_KEY", "g"),
            ("FLUX_API_KEY", "f"),
            ("FLUX_API_BASE", "https://flux.local/v1/"),
        ]));
        assert_eq!(config.chat.provider, "grok");
        assert_eq!(config.chat.api_key.as_deref(), Some("g"));
        assert_eq!(config.image.provider, "flux");
        assert_eq!(config.image.api_base, "https://flux.local/v1");
        assert!(config.generate_portraits);
    }

    #[test]
    fn explicit_provider_wins_over_key_detection() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("XAI_API_KEY", "x"),
            ("CASTCHAT_CHAT_PROVIDER", "dryrun"),
        ]));
        assert_eq!(config.chat.provider, "dryrun");
        assert_eq!(config.chat.api_key.as_deref(), Some("x"));
    }

    #[test]
    fn request_timeout_is_clamped_and_validated() {
        let config = EngineConfig::from_lookup(lookup_from(&[("CASTCHAT_REQUEST_TIMEOUT", "9999")]));
        assert_eq!(config.request_timeout, Duration::from_secs(600));

        let config = EngineConfig::from_lookup(lookup_from(&[("CASTCHAT_REQUEST_TIMEOUT", "soon")]));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn roster_settings_are_collected() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("SUPABASE_URL", "https://proj.supabase.co/"),
            ("SUPABASE_ANON_KEY", "anon"),
            ("CASTCHAT_ROSTER_FILE", "roster.json"),
        ]));
        assert_eq!(
            config.roster.supabase_url.as_deref(),
            Some("https://proj.supabase.co")
        );
        assert_eq!(config.roster.supabase_key.as_deref(), Some("anon"));
        assert_eq!(config.roster.roster_file, Some(PathBuf::from("roster.json")));
    }
}
