#[derive(Clone, Copy, Debug)]
pub struct CommandSpec {
    pub command: &'static str,
    pub usage: &'static str,
}

pub(crate) const NO_ARG_COMMANDS: &[&str] =
    &["help", "characters", "new", "threads", "gallery", "quit", "exit"];

pub(crate) const SINGLE_ARG_COMMANDS: &[&str] = &["character", "use", "delete", "forget"];

pub(crate) const RAW_ARG_COMMANDS: &[&str] = &["image"];

pub const CHAT_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "help",
        usage: "/help",
    },
    CommandSpec {
        command: "characters",
        usage: "/characters",
    },
    CommandSpec {
        command: "character",
        usage: "/character <id|name>",
    },
    CommandSpec {
        command: "new",
        usage: "/new",
    },
    CommandSpec {
        command: "threads",
        usage: "/threads",
    },
    CommandSpec {
        command: "use",
        usage: "/use <thread-id>",
    },
    CommandSpec {
        command: "rename",
        usage: "/rename <thread-id> <name>",
    },
    CommandSpec {
        command: "delete",
        usage: "/delete <thread-id>",
    },
    CommandSpec {
        command: "image",
        usage: "/image <prompt>",
    },
    CommandSpec {
        command: "gallery",
        usage: "/gallery",
    },
    CommandSpec {
        command: "forget",
        usage: "/forget <createdAt>",
    },
    CommandSpec {
        command: "quit",
        usage: "/quit",
    },
];

pub fn usage_for(command: &str) -> &'static str {
    CHAT_COMMANDS
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.usage)
        .unwrap_or("/help")
}

pub fn help_lines() -> Vec<&'static str> {
    CHAT_COMMANDS.iter().map(|spec| spec.usage).collect()
}
