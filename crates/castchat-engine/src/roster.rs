use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use castchat_contracts::roster::{Character, PortraitRecord};
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::providers::{response_json_or_error, truncate_text};

const ROSTER_SELECT: &str = "*,Series(name,universe)";

/// Where characters come from, and where generated portraits go.
pub trait RosterSource: Send + Sync {
    fn name(&self) -> &str;

    fn list_characters(&self) -> Result<Vec<Character>>;

    fn store_portrait(&self, record: &PortraitRecord) -> Result<()> {
        bail!(
            "{} roster cannot store portraits (character {})",
            self.name(),
            record.character_id
        )
    }
}

/// Reads the hosted `Roster` table through the Supabase REST interface.
pub struct SupabaseRoster {
    base_url: String,
    api_key: String,
    store_image_url: Option<String>,
    request_timeout: Duration,
    http: HttpClient,
}

impl SupabaseRoster {
    pub fn new(
        base_url: &str,
        api_key: &str,
        store_image_url: Option<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            store_image_url,
            request_timeout,
            http: HttpClient::new(),
        }
    }
}

impl RosterSource for SupabaseRoster {
    fn name(&self) -> &str {
        "supabase"
    }

    fn list_characters(&self) -> Result<Vec<Character>> {
        let endpoint = format!("{}/rest/v1/Roster", self.base_url);
        let response = self
            .http
            .get(&endpoint)
            .query(&[("select", ROSTER_SELECT), ("order", "name")])
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("accept", "application/json")
            .timeout(self.request_timeout)
            .send()
            .with_context(|| format!("Supabase roster request failed ({endpoint})"))?;
        let payload = response_json_or_error("Supabase", response)?;
        parse_roster_rows(payload)
    }

    fn store_portrait(&self, record: &PortraitRecord) -> Result<()> {
        let Some(endpoint) = self.store_image_url.as_deref() else {
            bail!("CASTCHAT_STORE_IMAGE_URL not set; portrait not stored");
        };
        let response = self
            .http
            .post(endpoint)
            .header("accept", "application/json")
            .json(record)
            .timeout(self.request_timeout)
            .send()
            .with_context(|| format!("store-image request failed ({endpoint})"))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().unwrap_or_default();
        bail!(
            "store-image request failed ({}): {}",
            status.as_u16(),
            truncate_text(&body, 512)
        )
    }
}

/// A JSON array of roster rows on disk. Read-only.
pub struct FileRoster {
    path: PathBuf,
}

impl FileRoster {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RosterSource for FileRoster {
    fn name(&self) -> &str {
        "file"
    }

    fn list_characters(&self) -> Result<Vec<Character>> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed reading {}", self.path.display()))?;
        let payload: Value = serde_json::from_str(&raw)
            .with_context(|| format!("{} is not valid JSON", self.path.display()))?;
        parse_roster_rows(payload)
    }
}

/// In-memory roster. Stored portraits are applied to the matching row.
#[derive(Debug, Default)]
pub struct StaticRoster {
    characters: Mutex<Vec<Character>>,
}

impl StaticRoster {
    pub fn new(characters: Vec<Character>) -> Self {
        Self {
            characters: Mutex::new(characters),
        }
    }
}

impl RosterSource for StaticRoster {
    fn name(&self) -> &str {
        "static"
    }

    fn list_characters(&self) -> Result<Vec<Character>> {
        let characters = self
            .characters
            .lock()
            .map_err(|_| anyhow!("static roster lock poisoned"))?;
        Ok(characters.clone())
    }

    fn store_portrait(&self, record: &PortraitRecord) -> Result<()> {
        let mut characters = self
            .characters
            .lock()
            .map_err(|_| anyhow!("static roster lock poisoned"))?;
        let Some(character) = characters
            .iter_mut()
            .find(|character| character.characterid == record.character_id)
        else {
            bail!("unknown character {}", record.character_id);
        };
        character.image1url = Some(record.url.clone());
        Ok(())
    }
}

/// A roster file takes precedence over a hosted roster.
pub fn roster_source_from_config(config: &EngineConfig) -> Option<Box<dyn RosterSource>> {
    if let Some(path) = config.roster.roster_file.as_ref() {
        return Some(Box::new(FileRoster::new(path.clone())));
    }
    match (
        config.roster.supabase_url.as_deref(),
        config.roster.supabase_key.as_deref(),
    ) {
        (Some(url), Some(key)) => Some(Box::new(SupabaseRoster::new(
            url,
            key,
            config.roster.store_image_url.clone(),
            config.request_timeout,
        ))),
        _ => None,
    }
}

/// Rows that do not match the schema are skipped rather than failing the
/// whole roster.
pub(crate) fn parse_roster_rows(payload: Value) -> Result<Vec<Character>> {
    let Value::Array(rows) = payload else {
        bail!("roster payload is not a JSON array");
    };
    let total = rows.len();
    let characters: Vec<Character> = rows
        .into_iter()
        .filter_map(|row| serde_json::from_value::<Character>(row).ok())
        .collect();
    let skipped = total - characters.len();
    if skipped > 0 {
        tracing::warn!(skipped, "ignoring malformed roster rows");
    }
    Ok(characters)
}
