pub mod command_parser;
pub mod command_registry;
pub mod context;
pub mod directive;

pub use command_parser::{parse_command, ChatCommand};
pub use command_registry::{help_lines, CHAT_COMMANDS};
pub use context::{build_context_window, clean_history, ChatTurn, CONTEXT_HISTORY_LIMIT};
pub use directive::{
    generated_image_caption, parse_reply, strip_history_markers, ImageDirective, ParsedReply,
    DIRECTIVE_PREFIX, GENERATED_IMAGE_LABEL,
};
