use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use image::{Rgb, RgbImage};
use reqwest::blocking::Client as HttpClient;
use reqwest::Url;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::config::ImageConfig;

use super::{map_object, response_json_or_error, truncate_text, ImageProvider, ImageRequest};

const FLUX_WIDTH: u32 = 1024;
const FLUX_HEIGHT: u32 = 768;
const DRYRUN_SIZE: u32 = 256;

/// Black Forest Labs image API: submit, then poll until the sample is ready.
pub struct FluxProvider {
    api_base: String,
    model: String,
    api_key: Option<String>,
    request_timeout: Duration,
    poll_interval: Duration,
    poll_timeout: Duration,
    http: HttpClient,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FluxPoll {
    Pending,
    Ready(String),
}

impl FluxProvider {
    pub fn new(config: &ImageConfig, request_timeout: Duration) -> Self {
        Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.trim_matches('/').to_string(),
            api_key: config.api_key.clone(),
            request_timeout,
            poll_interval: config.poll_interval,
            poll_timeout: config.poll_timeout,
            http: HttpClient::new(),
        }
    }

    fn post_flux_json(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &Map<String, Value>,
    ) -> Result<Value> {
        let response = self
            .http
            .post(endpoint)
            .header("accept", "application/json")
            .header("x-key", api_key)
            .json(&Value::Object(payload.clone()))
            .timeout(self.request_timeout)
            .send()
            .with_context(|| format!("Flux request failed ({endpoint})"))?;
        response_json_or_error("Flux", response)
    }

    fn get_flux_json(&self, url: &str, api_key: &str) -> Result<Value> {
        let response = self
            .http
            .get(url)
            .header("accept", "application/json")
            .header("x-key", api_key)
            .timeout(self.request_timeout)
            .send()
            .with_context(|| format!("Flux poll failed ({url})"))?;
        response_json_or_error("Flux poll", response)
    }
}

impl ImageProvider for FluxProvider {
    fn name(&self) -> &str {
        "flux"
    }

    fn generate(&self, request: &ImageRequest) -> Result<String> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("BFL_API_KEY or FLUX_API_KEY not set");
        };
        let endpoint = format!("{}/{}", self.api_base, self.model);
        let submitted = self.post_flux_json(&endpoint, api_key, &flux_payload(request))?;
        let polling_url = submitted
            .get("polling_url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Flux response missing polling_url"))?;

        let started = Instant::now();
        loop {
            let poll_payload = self.get_flux_json(&polling_url, api_key)?;
            if let FluxPoll::Ready(url) = interpret_poll(&poll_payload)? {
                return Ok(url);
            }
            if started.elapsed() >= self.poll_timeout {
                bail!(
                    "Flux polling timed out after {:.1}s",
                    self.poll_timeout.as_secs_f64()
                );
            }
            thread::sleep(self.poll_interval);
        }
    }
}

pub(crate) fn flux_payload(request: &ImageRequest) -> Map<String, Value> {
    let mut payload = map_object(json!({
        "prompt": request.prompt,
        "width": FLUX_WIDTH,
        "height": FLUX_HEIGHT,
        "output_format": "jpeg",
    }));
    if let Some(seed) = request.seed {
        payload.insert("seed".to_string(), Value::Number(seed.into()));
    }
    payload
}

pub(crate) fn interpret_poll(payload: &Value) -> Result<FluxPoll> {
    let status = payload
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if status == "ready" {
        let maybe_url = payload
            .get("result")
            .and_then(Value::as_object)
            .and_then(|row| row.get("sample").or_else(|| row.get("url")))
            .or_else(|| payload.get("sample"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        let Some(url) = maybe_url else {
            bail!("Flux ready response missing output URL");
        };
        return Ok(FluxPoll::Ready(url));
    }
    if matches!(
        status.as_str(),
        "error" | "failed" | "request moderated" | "content moderated" | "task not found"
    ) {
        bail!(
            "Flux generation failed: {}",
            truncate_text(&payload.to_string(), 512)
        );
    }
    Ok(FluxPoll::Pending)
}

/// Writes a solid-colour PNG derived from the prompt and returns its
/// `file://` URL.
pub struct DryrunImageProvider {
    out_dir: PathBuf,
}

impl DryrunImageProvider {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }
}

impl ImageProvider for DryrunImageProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &ImageRequest) -> Result<String> {
        fs::create_dir_all(&self.out_dir)
            .with_context(|| format!("failed to create {}", self.out_dir.display()))?;
        let seed = request.seed.unwrap_or_default();
        let path = self.out_dir.join(format!(
            "dryrun-{}-{}.png",
            timestamp_millis(),
            short_id(&request.prompt, seed as u64)
        ));
        write_dryrun_image(&path, DRYRUN_SIZE, DRYRUN_SIZE, &request.prompt, seed)?;
        let absolute = path
            .canonicalize()
            .with_context(|| format!("failed to resolve {}", path.display()))?;
        Url::from_file_path(&absolute)
            .map(String::from)
            .map_err(|_| anyhow!("cannot express {} as a file URL", absolute.display()))
    }
}

fn write_dryrun_image(path: &Path, width: u32, height: u32, prompt: &str, seed: i64) -> Result<()> {
    let (r, g, b) = color_from_prompt(prompt, seed as u64);
    let mut image = RgbImage::new(width, height);
    for pixel in image.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    image
        .save(path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(())
}

fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn short_id(prompt: &str, seed: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_be_bytes());
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}
