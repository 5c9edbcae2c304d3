use super::command_registry::{usage_for, NO_ARG_COMMANDS, RAW_ARG_COMMANDS, SINGLE_ARG_COMMANDS};

/// One line of REPL input, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Noop,
    Help,
    Quit,
    Characters,
    SelectCharacter(String),
    NewThread,
    Threads,
    UseThread(String),
    RenameThread { id: String, name: String },
    DeleteThread(String),
    GenerateImage(String),
    Gallery,
    ForgetImage(i64),
    Send(String),
    Usage(&'static str),
    Unknown { command: String, arg: String },
}

fn split_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn single_arg(arg: &str) -> Option<String> {
    let parts = split_args(arg);
    match parts.len() {
        0 => None,
        1 => Some(parts[0].clone()),
        _ => Some(parts.join(" ")),
    }
}

fn parse_no_arg(command: &str) -> ChatCommand {
    match command {
        "help" => ChatCommand::Help,
        "characters" => ChatCommand::Characters,
        "new" => ChatCommand::NewThread,
        "threads" => ChatCommand::Threads,
        "gallery" => ChatCommand::Gallery,
        _ => ChatCommand::Quit,
    }
}

fn parse_single_arg(command: &str, value: String) -> ChatCommand {
    match command {
        "character" => ChatCommand::SelectCharacter(value),
        "use" => ChatCommand::UseThread(value),
        "delete" => ChatCommand::DeleteThread(value),
        _ => match value.parse::<i64>() {
            Ok(created_at) => ChatCommand::ForgetImage(created_at),
            Err(_) => ChatCommand::Usage(usage_for("forget")),
        },
    }
}

pub fn parse_command(text: &str) -> ChatCommand {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return ChatCommand::Noop;
    }

    let Some(slash_tail) = raw_trimmed.strip_prefix('/') else {
        return ChatCommand::Send(text.to_string());
    };
    let command_len = slash_tail
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .count();
    if command_len == 0 {
        return ChatCommand::Send(text.to_string());
    }

    let command = slash_tail[..command_len].to_ascii_lowercase();
    let arg = slash_tail[command_len..].trim();

    if NO_ARG_COMMANDS.contains(&command.as_str()) {
        return parse_no_arg(&command);
    }

    if SINGLE_ARG_COMMANDS.contains(&command.as_str()) {
        return match single_arg(arg) {
            Some(value) => parse_single_arg(&command, value),
            None => ChatCommand::Usage(usage_for(&command)),
        };
    }

    if RAW_ARG_COMMANDS.contains(&command.as_str()) {
        if arg.is_empty() {
            return ChatCommand::Usage(usage_for(&command));
        }
        return ChatCommand::GenerateImage(arg.to_string());
    }

    if command == "rename" {
        let mut parts = split_args(arg);
        if parts.len() < 2 {
            return ChatCommand::Usage(usage_for("rename"));
        }
        let id = parts.remove(0);
        return ChatCommand::RenameThread {
            id,
            name: parts.join(" "),
        };
    }

    ChatCommand::Unknown {
        command,
        arg: arg.to_string(),
    }
}
