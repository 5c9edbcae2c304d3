//! Image directives embedded in chat replies.
//!
//! The chat model asks for a picture by writing `Generate_Image: <prompt>`
//! somewhere in its reply. The prompt runs to the end of that line. Only the
//! first directive is acted on; every directive is removed from the text the
//! user sees.

use std::sync::LazyLock;

use regex::Regex;

static DIRECTIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Generate_Image:\s*(.+?)(?:\n|$)").expect("directive pattern compiles")
});

// Without multi-line mode `$` is end of text, so these only match a marker
// sitting on the final line.
static GENERATED_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Generated image for:.*$").expect("generated marker pattern compiles")
});
static DIRECTIVE_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Generate_Image:.*$").expect("directive marker pattern compiles")
});

pub const DIRECTIVE_PREFIX: &str = "Generate_Image:";
pub const GENERATED_IMAGE_LABEL: &str = "Generated image for:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDirective {
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    /// Reply text with directives removed, trimmed.
    pub text: String,
    pub directive: Option<ImageDirective>,
}

pub fn parse_reply(raw: &str) -> ParsedReply {
    let directive = DIRECTIVE_RE
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|prompt| prompt.as_str().trim())
        .filter(|prompt| !prompt.is_empty())
        .map(|prompt| ImageDirective {
            prompt: prompt.to_string(),
        });
    let text = DIRECTIVE_RE.replace_all(raw, "").trim().to_string();
    ParsedReply { text, directive }
}

/// Removes a trailing image marker from a stored message before it is
/// replayed to the chat model.
pub fn strip_history_markers(content: &str) -> String {
    let without_generated = GENERATED_MARKER_RE.replace(content, "");
    DIRECTIVE_MARKER_RE
        .replace(&without_generated, "")
        .trim()
        .to_string()
}

pub fn generated_image_caption(prompt: &str) -> String {
    format!("{GENERATED_IMAGE_LABEL} {prompt}")
}
