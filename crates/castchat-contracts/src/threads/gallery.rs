use serde::{Deserialize, Serialize};

use super::now_millis;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub url: String,
    pub prompt: String,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// Generated images, newest first. `created_at` is the entry key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    images: Vec<GeneratedImage>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_images(images: Vec<GeneratedImage>) -> Self {
        Self { images }
    }

    pub fn images(&self) -> &[GeneratedImage] {
        self.images.as_slice()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn get(&self, created_at: i64) -> Option<&GeneratedImage> {
        self.images
            .iter()
            .find(|image| image.created_at == created_at)
    }

    pub fn add(&mut self, url: impl Into<String>, prompt: impl Into<String>) -> GeneratedImage {
        self.add_at(url, prompt, now_millis())
    }

    pub fn add_at(
        &mut self,
        url: impl Into<String>,
        prompt: impl Into<String>,
        now: i64,
    ) -> GeneratedImage {
        let mut created_at = now;
        while self.get(created_at).is_some() {
            created_at += 1;
        }
        let image = GeneratedImage {
            url: url.into(),
            prompt: prompt.into(),
            created_at,
        };
        self.images.insert(0, image.clone());
        image
    }

    pub fn remove(&mut self, created_at: i64) -> bool {
        let before = self.images.len();
        self.images.retain(|image| image.created_at != created_at);
        self.images.len() != before
    }
}
