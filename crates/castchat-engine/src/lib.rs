pub mod config;
pub mod providers;
pub mod roster;
pub mod session;

pub use config::EngineConfig;
pub use providers::{
    build_chat_provider, build_image_provider, error_chain_text, ChatProvider, ChatRequest,
    ImageProvider, ImageRequest,
};
pub use roster::{roster_source_from_config, FileRoster, RosterSource, StaticRoster, SupabaseRoster};
pub use session::{
    ChatSession, DispatchOutcome, DispatchReport, ImageOutcome, ImageReport, SessionParts,
    SkipReason, CHAT_FAILURE_REPLY, IMAGE_FAILURE_REPLY, ROSTER_LOAD_ERROR,
};
