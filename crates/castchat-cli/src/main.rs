use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;

use anyhow::{bail, Result};
use castchat_contracts::chat::{help_lines, parse_command, ChatCommand};
use castchat_contracts::roster::Character;
use castchat_contracts::storage::LoadPolicy;
use castchat_contracts::threads::{GeneratedImage, Message, Role, Thread};
use castchat_engine::{
    ChatSession, DispatchOutcome, DispatchReport, EngineConfig, ImageOutcome, ImageReport,
    SkipReason,
};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "warn,castchat=info";

#[derive(Debug, Parser)]
#[command(
    name = "castchat",
    version,
    about = "Chat with roster characters and generate images inline"
)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive session with slash commands.
    Chat,
    /// Send one message and print the reply.
    Send(SendArgs),
    /// Generate one image outside the chat flow.
    Image(ImageArgs),
    Threads,
    Gallery,
    Characters,
}

#[derive(Debug, Args)]
struct CommonArgs {
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Append an activity journal (JSONL) at this path.
    #[arg(long, global = true)]
    events: Option<PathBuf>,
    #[arg(long, global = true)]
    chat_provider: Option<String>,
    #[arg(long, global = true)]
    image_provider: Option<String>,
    #[arg(long, global = true)]
    roster_file: Option<PathBuf>,
    /// Character id or name to start with.
    #[arg(long, global = true)]
    character: Option<String>,
    /// Fail instead of resetting unreadable stored state.
    #[arg(long, global = true)]
    strict_state: bool,
    #[arg(long, global = true)]
    no_portraits: bool,
}

#[derive(Debug, Parser)]
struct SendArgs {
    #[arg(long)]
    message: String,
    /// Thread to send on; defaults to the most recent one.
    #[arg(long)]
    thread: Option<String>,
    #[arg(long)]
    new_thread: bool,
}

#[derive(Debug, Parser)]
struct ImageArgs {
    #[arg(long)]
    prompt: String,
}

fn main() {
    init_logging();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("castchat error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .compact()
        .try_init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let mut config = EngineConfig::from_env();
    apply_overrides(&mut config, &cli.common);
    tracing::debug!(
        data_dir = %config.data_dir.display(),
        chat = %config.chat.provider,
        image = %config.image.provider,
        "config resolved"
    );
    let session = ChatSession::from_config(&config)?;

    let code = match cli.command {
        Command::Chat => {
            run_chat(&session, cli.common.character.as_deref())?;
            0
        }
        Command::Send(args) => run_send(&session, cli.common.character.as_deref(), args)?,
        Command::Image(args) => run_image(&session, &args.prompt)?,
        Command::Threads => {
            print_threads(&session)?;
            0
        }
        Command::Gallery => {
            print_gallery(&session)?;
            0
        }
        Command::Characters => {
            session.load_characters()?;
            print_characters(&session)?;
            0
        }
    };
    // Portraits for new threads finish in the background; let them land
    // before the process exits.
    session.wait_for_portraits();
    Ok(code)
}

fn apply_overrides(config: &mut EngineConfig, args: &CommonArgs) {
    if let Some(dir) = args.data_dir.as_ref() {
        config.data_dir = dir.clone();
    }
    if let Some(path) = args.events.as_ref() {
        config.events_path = Some(path.clone());
    }
    if let Some(provider) = args.chat_provider.as_ref() {
        config.chat.provider = provider.clone();
    }
    if let Some(provider) = args.image_provider.as_ref() {
        config.image.provider = provider.clone();
    }
    if let Some(path) = args.roster_file.as_ref() {
        config.roster.roster_file = Some(path.clone());
    }
    if args.strict_state {
        config.load_policy = LoadPolicy::Strict;
    }
    if args.no_portraits {
        config.generate_portraits = false;
    }
}

fn run_chat(session: &ChatSession, character: Option<&str>) -> Result<()> {
    prepare_roster(session, character)?;
    println!(
        "Castchat started (chat: {}, image: {}). Type /help for commands.",
        session.chat_provider_name(),
        session.image_provider_name()
    );
    match session.active_thread()? {
        Some(thread) => println!("Active thread: {} ({})", thread.name, thread.id),
        None => println!("No threads yet. Use /new to start one."),
    }

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        match parse_command(input) {
            ChatCommand::Noop => continue,
            ChatCommand::Quit => break,
            ChatCommand::Help => println!("Commands: {}", help_lines().join(" ")),
            ChatCommand::Characters => print_characters(session)?,
            ChatCommand::SelectCharacter(query) => match session.select_character(&query)? {
                Some(found) => println!("Character set to {}", found.name),
                None => println!("No character matches '{query}'"),
            },
            ChatCommand::NewThread => {
                let thread = session.create_thread()?;
                println!("Started {} ({})", thread.name, thread.id);
            }
            ChatCommand::Threads => print_threads(session)?,
            ChatCommand::UseThread(id) => {
                if session.select_thread(&id)? {
                    if let Some(thread) = session.active_thread()? {
                        println!("Switched to {} ({})", thread.name, thread.id);
                        for message in &thread.messages {
                            println!("{}", render_message(message));
                        }
                    }
                } else {
                    println!("No thread '{id}'");
                }
            }
            ChatCommand::RenameThread { id, name } => {
                if session.rename_thread(&id, &name)? {
                    println!("Renamed {id} to {}", name.trim());
                } else {
                    println!("No thread '{id}'");
                }
            }
            ChatCommand::DeleteThread(id) => {
                if session.delete_thread(&id)? {
                    println!("Deleted {id}");
                } else {
                    println!("No thread '{id}'");
                }
            }
            ChatCommand::GenerateImage(prompt) => match session.generate_image(&prompt)? {
                ImageOutcome::Completed(report) => print_image_report(&report),
                ImageOutcome::Skipped(reason) => println!("{}", describe_skip(reason)),
            },
            ChatCommand::Gallery => print_gallery(session)?,
            ChatCommand::ForgetImage(created_at) => {
                if session.delete_image(created_at)? {
                    println!("Removed image {created_at}");
                } else {
                    println!("No image with createdAt {created_at}");
                }
            }
            ChatCommand::Send(text) => match session.send_message(&text)? {
                DispatchOutcome::Dispatched(report) => print_dispatch_report(&report),
                DispatchOutcome::Skipped(reason) => println!("{}", describe_skip(reason)),
            },
            ChatCommand::Usage(usage) => println!("Usage: {usage}"),
            ChatCommand::Unknown { command, .. } => {
                println!("Unknown command /{command}. Type /help for commands.")
            }
        }
    }
    Ok(())
}

fn run_send(session: &ChatSession, character: Option<&str>, args: SendArgs) -> Result<i32> {
    prepare_roster(session, character)?;
    if let Some(id) = args.thread.as_deref() {
        if !session.select_thread(id)? {
            bail!("no thread with id {id}");
        }
    }
    if args.new_thread || session.active_thread()?.is_none() {
        let thread = session.create_thread()?;
        println!("Started {} ({})", thread.name, thread.id);
    }
    match session.send_message(&args.message)? {
        DispatchOutcome::Dispatched(report) => {
            print_dispatch_report(&report);
            Ok(if report.chat_failed || report.image_failed {
                2
            } else {
                0
            })
        }
        DispatchOutcome::Skipped(reason) => {
            println!("{}", describe_skip(reason));
            Ok(2)
        }
    }
}

fn run_image(session: &ChatSession, prompt: &str) -> Result<i32> {
    match session.generate_image(prompt)? {
        ImageOutcome::Completed(report) => {
            print_image_report(&report);
            Ok(if report.failed { 2 } else { 0 })
        }
        ImageOutcome::Skipped(reason) => {
            println!("{}", describe_skip(reason));
            Ok(2)
        }
    }
}

fn prepare_roster(session: &ChatSession, character: Option<&str>) -> Result<()> {
    session.load_characters()?;
    if let Some(error) = session.roster_error()? {
        println!("{error}");
    }
    if let Some(query) = character {
        if session.select_character(query)?.is_none() {
            bail!("no character matches '{query}'");
        }
    }
    Ok(())
}

fn print_dispatch_report(report: &DispatchReport) {
    // The first appended message is the user's own input.
    for message in report.appended.iter().skip(1) {
        println!("{}", render_message(message));
    }
}

fn print_image_report(report: &ImageReport) {
    if report.appended.is_empty() {
        match report.gallery_entry.as_ref() {
            Some(entry) => println!("{}", render_image_line(entry)),
            None => println!("Image generation failed."),
        }
        return;
    }
    for message in report
        .appended
        .iter()
        .filter(|message| message.role == Role::Assistant)
    {
        println!("{}", render_message(message));
    }
}

fn print_threads(session: &ChatSession) -> Result<()> {
    let threads = session.threads()?;
    if threads.is_empty() {
        println!("No threads.");
        return Ok(());
    }
    let active = session.active_thread()?.map(|thread| thread.id);
    for thread in &threads {
        println!(
            "{}",
            render_thread_line(thread, active.as_deref() == Some(thread.id.as_str()))
        );
    }
    Ok(())
}

fn print_gallery(session: &ChatSession) -> Result<()> {
    let images = session.gallery()?;
    if images.is_empty() {
        println!("Gallery is empty.");
        return Ok(());
    }
    for image in &images {
        println!("{}", render_image_line(image));
    }
    Ok(())
}

fn print_characters(session: &ChatSession) -> Result<()> {
    let characters = session.characters()?;
    if characters.is_empty() {
        println!("No characters available.");
        return Ok(());
    }
    let selected = session
        .selected_character()?
        .map(|character| character.characterid);
    for character in &characters {
        println!(
            "{}",
            render_character_line(character, selected == Some(character.characterid))
        );
    }
    Ok(())
}

fn render_message(message: &Message) -> String {
    let mut out = format!("[{}] {}", message.role.as_str(), message.content);
    if let Some(url) = message.image_url.as_deref() {
        out.push_str(&format!("\n  image: {url}"));
    }
    out
}

fn render_thread_line(thread: &Thread, active: bool) -> String {
    format!(
        "{} {}  {}  ({} messages, {})",
        if active { "*" } else { " " },
        thread.id,
        thread.name,
        thread.messages.len(),
        format_millis(thread.created_at)
    )
}

fn render_image_line(image: &GeneratedImage) -> String {
    format!("{}  {}  {}", image.created_at, image.prompt, image.url)
}

fn render_character_line(character: &Character, selected: bool) -> String {
    format!(
        "{} {}  {} ({})  {}",
        if selected { "*" } else { " " },
        character.characterid,
        character.name,
        character.series_name(),
        character.display_image()
    )
}

fn describe_skip(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::BlankInput => "Nothing to send.",
        SkipReason::NoActiveThread => "No active thread. Use /new to start one.",
        SkipReason::InFlight => "Still waiting for the previous reply on this thread.",
    }
}

fn format_millis(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| millis.to_string())
}
