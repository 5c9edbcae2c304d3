use std::time::Duration;

use anyhow::{bail, Context, Result};
use castchat_contracts::chat::{ChatTurn, DIRECTIVE_PREFIX};
use castchat_contracts::threads::Role;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};

use crate::config::ChatConfig;

use super::{map_object, response_json_or_error, truncate_text, ChatProvider, ChatRequest};

const DRAWING_CUES: &[&str] = &["draw ", "paint ", "sketch ", "show me ", "picture of "];

/// xAI chat completions (OpenAI-compatible wire format).
pub struct GrokProvider {
    api_base: String,
    model: String,
    api_key: Option<String>,
    request_timeout: Duration,
    http: HttpClient,
}

impl GrokProvider {
    pub fn new(config: &ChatConfig, request_timeout: Duration) -> Self {
        Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            request_timeout,
            http: HttpClient::new(),
        }
    }
}

impl ChatProvider for GrokProvider {
    fn name(&self) -> &str {
        "grok"
    }

    fn complete(&self, request: &ChatRequest) -> Result<String> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("XAI_API_KEY or GROK_API_KEY not set");
        };
        let endpoint = format!("{}/chat/completions", self.api_base);
        let payload = completion_payload(&self.model, request);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .header("accept", "application/json")
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.request_timeout)
            .json(&payload)
            .send()
            .with_context(|| format!("Grok request failed ({endpoint})"))?;
        let parsed = response_json_or_error("Grok", response)?;
        completion_text(&parsed)
    }
}

/// The persona is sent as a leading system turn unless the window already
/// carries one.
pub(crate) fn completion_payload(model: &str, request: &ChatRequest) -> Value {
    let mut messages: Vec<Value> = Vec::with_capacity(request.messages.len() + 1);
    let has_system = request
        .messages
        .iter()
        .any(|turn| turn.role == Role::System);
    if !has_system {
        if let Some(persona) = request
            .persona
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            messages.push(json!({"role": "system", "content": persona}));
        }
    }
    for turn in &request.messages {
        messages.push(json!({
            "role": turn.role.as_str(),
            "content": turn.content,
        }));
    }
    let mut payload = map_object(json!({
        "model": model,
        "messages": messages,
    }));
    payload.insert("stream".to_string(), Value::Bool(false));
    Value::Object(payload)
}

/// An empty `content` is a valid (empty) reply; a missing one is not.
pub(crate) fn completion_text(payload: &Value) -> Result<String> {
    payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(|row| row.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .with_context(|| {
            format!(
                "Grok response missing choices[0].message.content: {}",
                truncate_text(&payload.to_string(), 256)
            )
        })
}

/// Offline stand-in that answers in character and asks for an image when
/// the user wants something drawn.
pub struct DryrunChatProvider;

impl ChatProvider for DryrunChatProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn complete(&self, request: &ChatRequest) -> Result<String> {
        let speaker = speaker_name(&request.messages);
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|turn| turn.role == Role::User)
            .map(|turn| turn.content.trim())
            .unwrap_or_default();
        if let Some(subject) = drawing_subject(last_user) {
            return Ok(format!(
                "{speaker} picks up a brush.\n{DIRECTIVE_PREFIX} {subject}"
            ));
        }
        Ok(format!(
            "{speaker} heard you say \"{}\".",
            truncate_text(last_user, 160)
        ))
    }
}

fn speaker_name(turns: &[ChatTurn]) -> String {
    turns
        .iter()
        .find(|turn| turn.role == Role::System)
        .and_then(|turn| turn.content.strip_prefix("You are "))
        .and_then(|rest| rest.split(" from ").next())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or("Assistant")
        .to_string()
}

fn drawing_subject(text: &str) -> Option<String> {
    let lowered = text.to_ascii_lowercase();
    DRAWING_CUES.iter().find_map(|cue| {
        let start = lowered.find(cue)? + cue.len();
        let subject = text
            .get(start..)?
            .trim()
            .trim_end_matches(['.', '!', '?'])
            .trim();
        (!subject.is_empty()).then(|| subject.to_string())
    })
}
