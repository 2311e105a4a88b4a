use anyhow::{anyhow, Result};
use clap::Parser;
use log::{debug, error, info, warn, LevelFilter};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use spectre_chat::chat::ChatEvent;
use spectre_chat::config::{self, ClientConfig};
use spectre_chat::models::Message;
use spectre_chat::utils;
use spectre_chat::{ChatClient, ChatError, EventSink};

/// Command line arguments for spectre-chat
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "spectre-chat: a terminal client for Spectre realtime chat.",
    long_about = "spectre-chat connects to a Spectre chat backend and keeps one conversation in sync.\n\n\
    The session token is read from SPECTRE_TOKEN or the saved configuration.\n\
    Type /help once connected for the list of commands."
)]
struct Args {
    /// Backend base URL, e.g. http://localhost:5000
    #[arg(long, value_name = "URL")]
    server: Option<String>,

    /// Use this configuration file instead of the default one
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Where to write the log
    #[arg(long, value_name = "PATH", default_value = "spectre-chat.log")]
    log_file: PathBuf,

    /// Log level (error, warn, info, debug, trace); RUST_LOG is used when absent
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[derive(Debug, PartialEq)]
enum Command {
    Send(String),
    Open(String),
    Close,
    Contacts,
    Chats,
    Online,
    Seen,
    Delete(String),
    Image { path: PathBuf, caption: String },
    Sound,
    Help,
    Quit,
    Unknown(String),
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Send(line.to_string()));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let command = match (name, arg) {
        ("open", id) if !id.is_empty() => Command::Open(id.to_string()),
        ("close", _) => Command::Close,
        ("contacts", _) => Command::Contacts,
        ("chats", _) => Command::Chats,
        ("online", _) => Command::Online,
        ("seen", _) => Command::Seen,
        ("delete", id) if !id.is_empty() => Command::Delete(id.to_string()),
        ("image", args) if !args.is_empty() => {
            let (path, caption) = match args.split_once(char::is_whitespace) {
                Some((path, caption)) => (path, caption.trim()),
                None => (args, ""),
            };
            Command::Image {
                path: PathBuf::from(path),
                caption: caption.to_string(),
            }
        }
        ("sound", _) => Command::Sound,
        ("help", _) => Command::Help,
        ("quit", _) | ("exit", _) => Command::Quit,
        _ => Command::Unknown(line.to_string()),
    };
    Some(command)
}

const HELP: &str = "\
  <text>                 send to the open conversation
  /open <user-id>        open a conversation
  /close                 close it
  /contacts, /chats      list contacts or past conversations
  /online                who is online
  /seen                  mark the conversation as read
  /delete <message-id>   delete a message for both sides
  /image <path> [text]   send an image (max 5 MB)
  /sound                 toggle the new-message bell
  /quit                  exit";

fn format_message(message: &Message, local_id: &str) -> String {
    let who = if message.sender_id == local_id { "me" } else { message.sender_id.as_str() };
    let mut line = format!(
        "[{}] {}: {}",
        message.created_at.format("%H:%M"),
        who,
        message.text
    );
    if message.image.is_some() {
        line.push_str(" [image]");
    }
    if message.sender_id == local_id && message.seen {
        line.push_str(" ✓✓");
    }
    line.push_str(&format!("  ({})", message.id));
    line
}

// Print engine events until the channel closes.
async fn print_events(mut rx: mpsc::Receiver<ChatEvent>, local_id: String) {
    while let Some(event) = rx.recv().await {
        match event {
            ChatEvent::ConversationOpened { counterpart } => println!("-- conversation with {} --", counterpart),
            ChatEvent::ConversationClosed => println!("-- conversation closed --"),
            ChatEvent::Incoming(message) => println!("{}", format_message(&message, &local_id)),
            ChatEvent::TypingChanged(state) => match state.typing_user_id {
                Some(user) if state.is_typing => println!("{} is typing...", user),
                _ => {}
            },
            ChatEvent::PresenceChanged(ids) => debug!("{} user(s) online", ids.len()),
            ChatEvent::Error(message) => eprintln!("! {}", message),
            ChatEvent::MessagesChanged { .. } | ChatEvent::ContactsLoaded(_) | ChatEvent::ChatPartnersLoaded(_) => {}
        }
    }
}

async fn send(client: &ChatClient, text: &str, image: Option<String>) {
    match client.store().send_message(text, image).await {
        Ok(message) => println!("{}", format_message(&message, client.local_id())),
        Err(ChatError::SendFailed { message, reason }) => {
            eprintln!("! not sent ({}): {}", reason, message.text);
        }
        Err(e) => eprintln!("! {}", e),
    }
}

// Returns false when the user asked to quit.
async fn handle_command(client: &ChatClient, config: &mut ClientConfig, command: Command) -> bool {
    let store = client.store();
    match command {
        Command::Send(text) => send(client, &text, None).await,
        Command::Image { path, caption } => match utils::image_data_url(&path) {
            Ok(url) => send(client, &caption, Some(url)).await,
            Err(e) => eprintln!("! {}", e),
        },
        Command::Open(id) => match store.open_conversation(&id).await {
            Ok(()) => {
                for message in store.messages() {
                    println!("{}", format_message(&message, client.local_id()));
                }
            }
            Err(e) => eprintln!("! {}", e),
        },
        Command::Close => store.close_conversation(),
        Command::Contacts => {
            if let Ok(contacts) = store.load_contacts().await {
                for user in contacts {
                    let online = if client.presence().is_online(&user.id) { "*" } else { " " };
                    println!("{} {}  {}", online, user.id, user.full_name);
                }
            }
        }
        Command::Chats => {
            if let Ok(partners) = store.load_chat_partners().await {
                for partner in partners {
                    println!(
                        "  {}  {}  {}",
                        partner.user.id,
                        partner.user.full_name,
                        partner.last_message.unwrap_or_default()
                    );
                }
            }
        }
        Command::Online => {
            let online = client.presence().online_users();
            println!("{} online: {}", online.len(), online.join(", "));
        }
        Command::Seen => {
            if let Err(e) = store.mark_seen() {
                eprintln!("! {}", e);
            }
        }
        Command::Delete(id) => {
            if let Err(e) = store.delete_message(&id) {
                eprintln!("! {}", e);
            }
        }
        Command::Sound => {
            config.sound_enabled = client.toggle_sound();
            println!("Sound {}", if config.sound_enabled { "on" } else { "off" });
            if let Err(e) = config::save_config(config) {
                warn!("Failed to persist sound setting: {}", e);
            }
        }
        Command::Help => println!("{}", HELP),
        Command::Quit => return false,
        Command::Unknown(line) => eprintln!("Unknown command: {} (try /help)", line),
    }
    true
}

async fn run_main_loop(client: &ChatClient, config: &mut ClientConfig) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = parse_command(&line) else {
            continue;
        };
        if !handle_command(client, config, command).await {
            break;
        }
    }
    Ok(())
}

fn config_exists() -> bool {
    config::get_config_path().map(|path| path.exists()).unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match &args.log_level {
        Some(level) => Some(
            level
                .parse::<LevelFilter>()
                .map_err(|_| anyhow!("Unknown log level '{}'", level))?,
        ),
        None => None,
    };
    utils::setup_logging(args.log_file.to_str(), level)?;
    info!("spectre-chat starting up");
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);
    info!("Logging to file: {}", args.log_file.display());

    if let Some(path) = &args.config {
        config::set_config_path_override(path.clone());
        info!("Configuration path overridden to: {}", path.display());
    }

    let first_run = !config_exists();
    let mut config = config::load_config()?;
    if let Some(server) = &args.server {
        config.server_url = server.trim_end_matches('/').to_string();
    }

    println!("Connecting to {}... please wait...", config.server_url);
    let (events, rx) = EventSink::channel(256);
    let (client, user) = match ChatClient::connect(&config, events).await {
        Ok(connected) => connected,
        Err(e) => {
            error!("Failed to connect: {}", e);
            eprintln!("Failed to connect: {}", e);
            return Err(e);
        }
    };
    println!("Signed in as {} ({}). Type /help for commands.", user.full_name, user.id);

    if first_run {
        if let Err(e) = config::save_config(&config) {
            warn!("Failed to save configuration: {}", e);
        }
    }

    let printer = tokio::spawn(print_events(rx, user.id.clone()));
    let result = run_main_loop(&client, &mut config).await;

    client.shutdown();
    drop(client);
    printer.abort();
    info!("spectre-chat shut down");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_text_is_send() {
        assert_eq!(parse_command("  hello there "), Some(Command::Send("hello there".to_string())));
        assert_eq!(parse_command("   "), None);
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("/open u2"), Some(Command::Open("u2".to_string())));
        assert_eq!(parse_command("/delete m5"), Some(Command::Delete("m5".to_string())));
        assert_eq!(parse_command("/quit"), Some(Command::Quit));
        assert_eq!(
            parse_command("/image cat.png look at this"),
            Some(Command::Image {
                path: PathBuf::from("cat.png"),
                caption: "look at this".to_string()
            })
        );
        assert_eq!(parse_command("/open"), Some(Command::Unknown("/open".to_string())));
    }
}
