use std::sync::Arc;

use anyhow::{bail, Context};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::threads::{GeneratedImage, Thread};

use super::KeyValueStore;

pub const THREADS_KEY: &str = "chatThreads";
pub const GALLERY_KEY: &str = "generatedImages";
pub const SCHEMA_VERSION: u64 = 1;

/// What to do with a stored payload that cannot be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadPolicy {
    /// Move the payload aside under `<key>.corrupt` and start empty.
    #[default]
    Reset,
    /// Return the decode error.
    Strict,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedState {
    pub threads: Vec<Thread>,
    pub images: Vec<GeneratedImage>,
    /// Keys whose payload was discarded under `LoadPolicy::Reset`.
    pub reset_keys: Vec<String>,
}

#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence").finish_non_exhaustive()
    }
}

impl Persistence {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn load(&self, policy: LoadPolicy) -> anyhow::Result<PersistedState> {
        let mut state = PersistedState::default();
        if let Some(threads) = self.load_key::<Thread>(THREADS_KEY, policy, &mut state.reset_keys)? {
            state.threads = threads;
        }
        if let Some(images) =
            self.load_key::<GeneratedImage>(GALLERY_KEY, policy, &mut state.reset_keys)?
        {
            state.images = images;
        }
        Ok(state)
    }

    pub fn save_threads(&self, threads: &[Thread]) -> anyhow::Result<()> {
        self.store
            .set(THREADS_KEY, &encode_items(threads)?)
            .context("failed persisting threads")
    }

    pub fn save_gallery(&self, images: &[GeneratedImage]) -> anyhow::Result<()> {
        self.store
            .set(GALLERY_KEY, &encode_items(images)?)
            .context("failed persisting gallery")
    }

    fn load_key<T: DeserializeOwned>(
        &self,
        key: &str,
        policy: LoadPolicy,
        reset_keys: &mut Vec<String>,
    ) -> anyhow::Result<Option<Vec<T>>> {
        let Some(raw) = self.store.get(key)? else {
            return Ok(None);
        };
        match decode_items::<T>(key, &raw) {
            Ok(items) => Ok(Some(items)),
            Err(err) => match policy {
                LoadPolicy::Strict => Err(err),
                LoadPolicy::Reset => {
                    tracing::warn!(key, error = %format!("{err:#}"), "discarding unreadable stored state");
                    self.store
                        .set(&format!("{key}.corrupt"), &raw)
                        .with_context(|| format!("failed moving aside {key}"))?;
                    self.store.set(key, &encode_items::<Value>(&[])?)?;
                    reset_keys.push(key.to_string());
                    Ok(None)
                }
            },
        }
    }
}

fn decode_items<T: DeserializeOwned>(key: &str, raw: &str) -> anyhow::Result<Vec<T>> {
    let payload: Value =
        serde_json::from_str(raw).with_context(|| format!("{key} is not valid JSON"))?;
    let items = match payload {
        // Unversioned array written by earlier releases.
        Value::Array(items) => Value::Array(items),
        Value::Object(mut obj) => {
            let version = obj
                .get("schema_version")
                .and_then(Value::as_u64)
                .with_context(|| format!("{key} is missing schema_version"))?;
            if version > SCHEMA_VERSION {
                bail!("{key} has schema_version {version}, newer than supported {SCHEMA_VERSION}");
            }
            obj.remove("items")
                .with_context(|| format!("{key} is missing items"))?
        }
        _ => bail!("{key} has unexpected JSON shape"),
    };
    serde_json::from_value(items).with_context(|| format!("{key} items do not match schema"))
}

fn encode_items<T: Serialize>(items: &[T]) -> anyhow::Result<String> {
    Ok(serde_json::to_string(&json!({
        "schema_version": SCHEMA_VERSION,
        "items": items,
    }))?)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};

    use crate::storage::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
    use crate::threads::{GeneratedImage, Message, Thread};

    use super::{LoadPolicy, Persistence, GALLERY_KEY, THREADS_KEY};

    fn sample_thread() -> Thread {
        Thread {
            id: "1700000000000".to_string(),
            name: "Saber Chat".to_string(),
            messages: vec![
                Message::user("hi"),
                Message::assistant("Generated image for: a cat").with_image("https://x/cat.png"),
            ],
            created_at: 1_700_000_000_000,
            character_id: 7,
        }
    }

    #[test]
    fn save_then_load_restores_both_stores() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = Arc::new(FileKeyValueStore::new(temp.path()));
        let persistence = Persistence::new(store.clone());

        let image = GeneratedImage {
            url: "https://x/cat.png".to_string(),
            prompt: "a cat".to_string(),
            created_at: 5,
        };
        persistence.save_threads(&[sample_thread()])?;
        persistence.save_gallery(&[image.clone()])?;

        let raw = store.get(THREADS_KEY)?.unwrap_or_default();
        let envelope: Value = serde_json::from_str(&raw)?;
        assert_eq!(envelope["schema_version"], json!(1));
        assert_eq!(envelope["items"][0]["characterId"], json!(7));

        let loaded = persistence.load(LoadPolicy::Strict)?;
        assert_eq!(loaded.threads, vec![sample_thread()]);
        assert_eq!(loaded.images, vec![image]);
        assert!(loaded.reset_keys.is_empty());
        Ok(())
    }

    #[test]
    fn legacy_bare_arrays_load() -> anyhow::Result<()> {
        let legacy_threads = json!([{
            "id": "1",
            "name": "Old Chat",
            "messages": [{"role": "user", "content": "hello"}],
            "createdAt": 1,
            "characterId": 3,
            "isEditing": false
        }]);
        let legacy_images = json!([{"url": "u", "prompt": "p", "createdAt": 9}]);
        let store = MemoryKeyValueStore::new()
            .with_entry(THREADS_KEY, &legacy_threads.to_string())
            .with_entry(GALLERY_KEY, &legacy_images.to_string());

        let loaded = Persistence::new(Arc::new(store)).load(LoadPolicy::Strict)?;
        assert_eq!(loaded.threads.len(), 1);
        assert_eq!(loaded.threads[0].messages[0].content, "hello");
        assert_eq!(loaded.images[0].created_at, 9);
        Ok(())
    }

    #[test]
    fn missing_keys_load_empty() -> anyhow::Result<()> {
        let loaded = Persistence::new(Arc::new(MemoryKeyValueStore::new())).load(LoadPolicy::Strict)?;
        assert!(loaded.threads.is_empty());
        assert!(loaded.images.is_empty());
        Ok(())
    }

    #[test]
    fn strict_policy_surfaces_corrupt_state() {
        let store = MemoryKeyValueStore::new().with_entry(THREADS_KEY, "{not json");
        let err = Persistence::new(Arc::new(store))
            .load(LoadPolicy::Strict)
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("chatThreads is not valid JSON"));
    }

    #[test]
    fn reset_policy_moves_corrupt_state_aside() -> anyhow::Result<()> {
        let store = Arc::new(
            MemoryKeyValueStore::new()
                .with_entry(THREADS_KEY, "{not json")
                .with_entry(GALLERY_KEY, &json!([{"url": "u", "prompt": "p", "createdAt": 1}]).to_string()),
        );
        let loaded = Persistence::new(store.clone()).load(LoadPolicy::Reset)?;

        assert!(loaded.threads.is_empty());
        assert_eq!(loaded.images.len(), 1);
        assert_eq!(loaded.reset_keys, vec![THREADS_KEY.to_string()]);
        assert_eq!(store.get("chatThreads.corrupt")?.as_deref(), Some("{not json"));
        Ok(())
    }

    #[test]
    fn newer_schema_is_rejected() {
        let payload = json!({"schema_version": 99, "items": []}).to_string();
        let store = MemoryKeyValueStore::new().with_entry(GALLERY_KEY, &payload);
        let result = Persistence::new(Arc::new(store)).load(LoadPolicy::Strict);
        assert!(result.is_err());
    }

    #[test]
    fn empty_lists_are_written() -> anyhow::Result<()> {
        let store = Arc::new(MemoryKeyValueStore::new());
        let persistence = Persistence::new(store.clone());
        persistence.save_threads(&[sample_thread()])?;
        persistence.save_threads(&[])?;
        assert!(persistence.load(LoadPolicy::Strict)?.threads.is_empty());
        Ok(())
    }
}
