use serde::{Deserialize, Serialize};

pub const DEFAULT_CHARACTER_IMAGE: &str = "/default-character.png";
pub const UNKNOWN_SERIES: &str = "unknown series";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    pub name: String,
    #[serde(default)]
    pub universe: Option<String>,
}

/// One roster row. Field names match the hosted `Roster` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    pub characterid: i64,
    pub name: String,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub image1url: Option<String>,
    #[serde(rename = "Series", default)]
    pub series: Option<Series>,
}

impl Character {
    pub fn display_image(&self) -> &str {
        self.image1url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_CHARACTER_IMAGE)
    }

    pub fn has_portrait(&self) -> bool {
        self.image1url
            .as_deref()
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn bio_text(&self) -> &str {
        self.bio.as_deref().unwrap_or("")
    }

    pub fn series_name(&self) -> &str {
        self.series
            .as_ref()
            .map(|series| series.name.as_str())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(UNKNOWN_SERIES)
    }

    /// System preamble that puts the chat model in character.
    pub fn persona_preamble(&self) -> String {
        format!(
            "You are {} from {}. {}",
            self.name,
            self.series_name(),
            self.bio_text()
        )
        .trim_end()
        .to_string()
    }

    pub fn portrait_prompt(&self) -> String {
        let first_sentence = self.bio_text().split('.').next().unwrap_or("").trim();
        format!(
            "Create an anime style portrait of {}, a {}. Character shown in a noble pose, \
facing slightly to the side, elegant and composed. Expression is confident and cheerful. \
Premium quality background with subtle magical effects. High-quality anime art style, \
clean lines, vibrant colors.",
            self.name, first_sentence
        )
    }
}

/// Persisted portrait for a character that had none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortraitRecord {
    pub character_id: i64,
    pub url: String,
    pub prompt: String,
    pub style: String,
    pub seed: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roster {
    characters: Vec<Character>,
}

impl Roster {
    pub fn new(mut characters: Vec<Character>) -> Self {
        characters.sort_by(|a, b| a.name.cmp(&b.name));
        Self { characters }
    }

    pub fn characters(&self) -> &[Character] {
        self.characters.as_slice()
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }

    pub fn first(&self) -> Option<&Character> {
        self.characters.first()
    }

    pub fn find(&self, id: i64) -> Option<&Character> {
        self.characters
            .iter()
            .find(|character| character.characterid == id)
    }

    /// Exact id, or case-insensitive name match.
    pub fn lookup(&self, query: &str) -> Option<&Character> {
        let query = query.trim();
        if let Ok(id) = query.parse::<i64>() {
            if let Some(found) = self.find(id) {
                return Some(found);
            }
        }
        self.characters
            .iter()
            .find(|character| character.name.eq_ignore_ascii_case(query))
    }

    /// Stale ids resolve to the first roster entry.
    pub fn resolve(&self, id: i64) -> Option<&Character> {
        self.find(id).or_else(|| self.first())
    }
}

/// Stand-in used when neither the thread's character nor any roster entry
/// is available.
pub fn placeholder_character(id: i64) -> Character {
    Character {
        characterid: id,
        name: "Assistant".to_string(),
        bio: None,
        image1url: None,
        series: None,
    }
}
