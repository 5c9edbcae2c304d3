pub mod gallery;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::roster::Character;

pub use gallery::{Gallery, GeneratedImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(rename = "imageUrl", default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            image_url: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            image_url: None,
        }
    }

    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(rename = "characterId")]
    pub character_id: i64,
}

/// Ordered conversation threads, newest first, with at most one active.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadStore {
    threads: Vec<Thread>,
    active: Option<String>,
}

impl ThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hydrates from persisted threads; the first one becomes active.
    pub fn from_threads(threads: Vec<Thread>) -> Self {
        let active = threads.first().map(|thread| thread.id.clone());
        Self { threads, active }
    }

    pub fn threads(&self) -> &[Thread] {
        self.threads.as_slice()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Thread> {
        self.threads.iter().find(|thread| thread.id == id)
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active(&self) -> Option<&Thread> {
        self.get(self.active.as_deref()?)
    }

    pub fn create(&mut self, character: &Character) -> Thread {
        self.create_at(character, now_millis())
    }

    pub fn create_at(&mut self, character: &Character, now: i64) -> Thread {
        let created_at = self.next_free_millis(now);
        let thread = Thread {
            id: created_at.to_string(),
            name: format!("{} Chat", character.name),
            messages: Vec::new(),
            created_at,
            character_id: character.characterid,
        };
        self.threads.insert(0, thread.clone());
        self.active = Some(thread.id.clone());
        thread
    }

    pub fn rename(&mut self, id: &str, new_name: &str) -> bool {
        let name = new_name.trim();
        if name.is_empty() {
            return false;
        }
        match self.get_mut(id) {
            Some(thread) => {
                thread.name = name.to_string();
                true
            }
            None => false,
        }
    }

    pub fn delete(&mut self, id: &str) -> bool {
        let before = self.threads.len();
        self.threads.retain(|thread| thread.id != id);
        if self.threads.len() == before {
            return false;
        }
        if self.active.as_deref() == Some(id) {
            self.active = self.threads.first().map(|thread| thread.id.clone());
        }
        true
    }

    pub fn select(&mut self, id: &str) -> bool {
        if self.get(id).is_none() {
            return false;
        }
        self.active = Some(id.to_string());
        true
    }

    pub fn replace_messages(&mut self, id: &str, messages: Vec<Message>) -> bool {
        match self.get_mut(id) {
            Some(thread) => {
                thread.messages = messages;
                true
            }
            None => false,
        }
    }

    pub fn push_message(&mut self, id: &str, message: Message) -> bool {
        match self.get_mut(id) {
            Some(thread) => {
                thread.messages.push(message);
                true
            }
            None => false,
        }
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Thread> {
        self.threads.iter_mut().find(|thread| thread.id == id)
    }

    fn next_free_millis(&self, now: i64) -> i64 {
        let mut candidate = now;
        while self
            .threads
            .iter()
            .any(|thread| thread.id == candidate.to_string())
        {
            candidate += 1;
        }
        candidate
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use crate::roster::Character;

    use super::{Message, Role, Thread, ThreadStore};

    fn character(id: i64, name: &str) -> Character {
        Character {
            characterid: id,
            name: name.to_string(),
            bio: Some(format!("{name} is a knight.")),
            image1url: None,
            series: None,
        }
    }

    #[test]
    fn create_prepends_and_activates() {
        let mut store = ThreadStore::new();
        let first = store.create_at(&character(1, "Saber"), 1_000);
        let second = store.create_at(&character(2, "Rin"), 2_000);

        assert_eq!(store.threads()[0].id, second.id);
        assert_eq!(store.threads()[1].id, first.id);
        assert_eq!(store.active_id(), Some(second.id.as_str()));
        assert_eq!(second.name, "Rin Chat");
        assert_eq!(second.character_id, 2);
        assert!(second.messages.is_empty());
    }

    #[test]
    fn create_in_same_millisecond_keeps_ids_unique() {
        let mut store = ThreadStore::new();
        let a = store.create_at(&character(1, "Saber"), 5_000);
        let b = store.create_at(&character(1, "Saber"), 5_000);
        let c = store.create_at(&character(1, "Saber"), 5_000);

        assert_eq!(a.id, "5000");
        assert_eq!(b.id, "5001");
        assert_eq!(c.id, "5002");
        assert_eq!(c.created_at, 5_002);
    }

    #[test]
    fn delete_active_falls_back_to_first_remaining() {
        let mut store = ThreadStore::new();
        let oldest = store.create_at(&character(1, "A"), 1);
        let middle = store.create_at(&character(1, "B"), 2);
        let newest = store.create_at(&character(1, "C"), 3);

        assert!(store.delete(&newest.id));
        assert_eq!(store.active_id(), Some(middle.id.as_str()));

        assert!(store.select(&oldest.id));
        assert!(store.delete(&middle.id));
        assert_eq!(store.active_id(), Some(oldest.id.as_str()));

        assert!(store.delete(&oldest.id));
        assert_eq!(store.active_id(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn delete_unknown_thread_changes_nothing() {
        let mut store = ThreadStore::new();
        let thread = store.create_at(&character(1, "A"), 1);
        assert!(!store.delete("missing"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.active_id(), Some(thread.id.as_str()));
    }

    #[test]
    fn rename_rejects_blank_names() {
        let mut store = ThreadStore::new();
        let thread = store.create_at(&character(1, "A"), 1);

        assert!(!store.rename(&thread.id, "   "));
        assert_eq!(store.get(&thread.id).map(|t| t.name.as_str()), Some("A Chat"));

        assert!(store.rename(&thread.id, "  Evening talk "));
        assert_eq!(
            store.get(&thread.id).map(|t| t.name.as_str()),
            Some("Evening talk")
        );
        assert!(!store.rename("missing", "x"));
    }

    #[test]
    fn select_only_accepts_known_ids() {
        let mut store = ThreadStore::new();
        let a = store.create_at(&character(1, "A"), 1);
        let _b = store.create_at(&character(1, "B"), 2);

        assert!(!store.select("missing"));
        assert!(store.select(&a.id));
        assert_eq!(store.active().map(|t| t.id.as_str()), Some(a.id.as_str()));
    }

    #[test]
    fn replace_messages_only_touches_matching_thread() {
        let mut store = ThreadStore::new();
        let a = store.create_at(&character(1, "A"), 1);
        let b = store.create_at(&character(1, "B"), 2);

        assert!(store.replace_messages(&a.id, vec![Message::user("hi")]));
        assert!(store.push_message(&a.id, Message::assistant("hello")));

        let messages = &store.get(&a.id).map(|t| t.messages.clone()).unwrap_or_default();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::Assistant);
        assert!(store.get(&b.id).map(|t| t.messages.is_empty()).unwrap_or(false));
        assert!(!store.push_message("missing", Message::user("lost")));
    }

    #[test]
    fn hydrate_selects_first_thread() {
        let threads = vec![
            Thread {
                id: "2".to_string(),
                name: "second".to_string(),
                messages: Vec::new(),
                created_at: 2,
                character_id: 1,
            },
            Thread {
                id: "1".to_string(),
                name: "first".to_string(),
                messages: Vec::new(),
                created_at: 1,
                character_id: 1,
            },
        ];
        let store = ThreadStore::from_threads(threads);
        assert_eq!(store.active_id(), Some("2"));
        assert_eq!(ThreadStore::from_threads(Vec::new()).active_id(), None);
    }

    #[test]
    fn message_serializes_with_storage_field_names() -> anyhow::Result<()> {
        let message = Message::assistant("Generated image for: cat").with_image("https://x/cat.png");
        let value = serde_json::to_value(&message)?;
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["imageUrl"], "https://x/cat.png");

        let plain = serde_json::to_value(Message::user("hi"))?;
        assert!(plain.get("imageUrl").is_none());
        Ok(())
    }
}
