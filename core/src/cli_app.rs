use crate::chat::{Conversation, DeliveryStatus};
use crate::realtime::connection::{ConnectionState, ConnectionStatus};
use crate::realtime::correlator::PendingReply;
use crate::realtime::protocol::{AgentResponsePayload, ChatDeliverPayload, EVENT_CHAT_DELIVER};
use crate::session::ChatSession;
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};

/// One line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Search(String),
    Ask(String),
    Open {
        user_id: String,
        listing_id: Option<String>,
    },
    Threads,
    Select(String),
    Status,
    Reconnect,
    Help,
    Quit,
    /// Chat message to the active thread
    Say(String),
    Empty,
    Invalid(String),
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    if !line.starts_with('/') {
        return Command::Say(line.to_string());
    }

    let (name, rest) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (line, ""),
    };

    match name {
        "/search" if !rest.is_empty() => Command::Search(rest.to_string()),
        "/search" => Command::Invalid("Usage: /search <query>".into()),
        "/ask" if !rest.is_empty() => Command::Ask(rest.to_string()),
        "/ask" => Command::Invalid("Usage: /ask <question>".into()),
        "/open" => {
            let mut parts = rest.split_whitespace();
            match parts.next() {
                Some(user_id) => Command::Open {
                    user_id: user_id.to_string(),
                    listing_id: parts.next().map(str::to_string),
                },
                None => Command::Invalid("Usage: /open <user_id> [listing_id]".into()),
            }
        }
        "/threads" => Command::Threads,
        "/select" if !rest.is_empty() => Command::Select(rest.to_string()),
        "/select" => Command::Invalid("Usage: /select <thread_id>".into()),
        "/status" => Command::Status,
        "/reconnect" => Command::Reconnect,
        "/help" => Command::Help,
        "/quit" | "/exit" => Command::Quit,
        other => Command::Invalid(format!("Unknown command: {}", other)),
    }
}

/// Interactive loop over stdin until `/quit` or EOF
pub async fn run(session: ChatSession) -> anyhow::Result<()> {
    print_banner(session.user_id());
    spawn_status_printer(&session);

    let me = session.user_id().to_string();
    session.subscribe(EVENT_CHAT_DELIVER, move |frame| {
        let payload: ChatDeliverPayload = frame.decode_payload()?;
        if payload.from_user_id != me {
            println!(
                "{} {}: {}",
                "←".green().bold(),
                payload.from_user_id.cyan(),
                payload.text
            );
        }
        Ok(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            Command::Empty => {}
            Command::Quit => break,
            Command::Help => print_help(),
            Command::Invalid(msg) => eprintln!("{} {}", "✗".red().bold(), msg.yellow()),
            Command::Status => print_status(&session.status()),
            Command::Reconnect => {
                if let Err(e) = session.reconnect() {
                    eprintln!("{} {}", "✗".red().bold(), e);
                }
            }
            Command::Threads => print_threads(&session),
            Command::Select(id) => match session.select_thread(&id) {
                Ok(()) => {
                    println!("{} Active thread: {}", "✓".green(), id.cyan());
                    if let Err(e) = session.mark_seen(&id) {
                        eprintln!("{} Read receipt not sent: {}", "!".yellow(), e);
                    }
                }
                Err(e) => eprintln!("{} {}", "✗".red().bold(), e),
            },
            Command::Open { user_id, listing_id } => {
                match session.open_thread(&user_id, listing_id.as_deref(), None, None) {
                    Ok(id) => println!("{} Active thread: {}", "✓".green(), id.cyan()),
                    Err(e) => eprintln!("{} {}", "✗".red().bold(), e),
                }
            }
            Command::Search(query) => match session.search(&query) {
                Ok(reply) => spawn_answer_printer(reply),
                Err(e) => eprintln!("{} Search not sent: {}", "✗".red().bold(), e),
            },
            Command::Ask(question) => match session.ask(&question) {
                Ok(reply) => spawn_answer_printer(reply),
                Err(e) => eprintln!("{} Question not sent: {}", "✗".red().bold(), e),
            },
            Command::Say(text) => {
                let Some(thread) = session.active_thread_id() else {
                    eprintln!(
                        "{} No active thread. Use {} first.",
                        "✗".red().bold(),
                        "/open <user_id>".cyan()
                    );
                    continue;
                };
                if let Err(e) = session.send_chat(&thread, &text) {
                    eprintln!("{} Message not sent: {}", "✗".red().bold(), e);
                }
            }
        }
    }

    session.logout();
    println!("{}", "Bye.".dimmed());
    Ok(())
}

fn spawn_answer_printer(reply: PendingReply) {
    tokio::spawn(async move {
        match ChatSession::answer(reply).await {
            Ok(answer) => print_answer(&answer),
            Err(e) => eprintln!("{} {}", "✗".red().bold(), e),
        }
    });
}

fn spawn_status_printer(session: &ChatSession) {
    let mut rx = session.watch_status();
    tokio::spawn(async move {
        let mut last = rx.borrow().state;
        while rx.changed().await.is_ok() {
            let status = rx.borrow_and_update().clone();
            if status.state != last {
                last = status.state;
                print_status(&status);
            }
        }
    });
}

fn print_banner(user_id: &str) {
    println!("{}", "⚡ MarketLink realtime client".bright_cyan().bold());
    println!("  Signed in as {}", user_id.cyan());
    println!("  Type {} for commands", "/help".cyan());
    println!();
}

fn print_help() {
    println!("{}", "Commands:".bright_white().bold());
    println!("  {} <query>              AI listing search", "/search".cyan());
    println!("  {} <question>              Ask the assistant", "/ask".cyan());
    println!("  {} <user_id> [listing_id] Open a conversation", "/open".cyan());
    println!("  {}                     List conversations", "/threads".cyan());
    println!("  {} <thread_id>          Switch conversation", "/select".cyan());
    println!("  {}                      Connection status", "/status".cyan());
    println!("  {}                   Reconnect now", "/reconnect".cyan());
    println!("  {}                        Quit", "/quit".cyan());
    println!("  Anything else is sent to the active conversation.");
}

fn print_status(status: &ConnectionStatus) {
    let state = format!("{:?}", status.state);
    let state = match status.state {
        ConnectionState::Open => state.green(),
        ConnectionState::Connecting | ConnectionState::Closing => state.yellow(),
        ConnectionState::Failed => state.red().bold(),
        ConnectionState::Idle | ConnectionState::Closed => state.dimmed(),
    };
    print!("{} {}", "●".bright_white(), state);
    if status.reconnect_attempts > 0 {
        print!(" (reconnect attempt {})", status.reconnect_attempts);
    }
    match &status.last_error {
        Some(fault) => println!(" {}", fault.to_string().red()),
        None => println!(),
    }
}

fn print_threads(session: &ChatSession) {
    let threads = session.threads();
    if threads.is_empty() {
        println!("{}", "No conversations yet".dimmed());
        return;
    }
    let active = session.active_thread_id();
    for thread in &threads {
        let marker = if active.as_deref() == Some(thread.id.as_str()) {
            "▶".green().bold()
        } else {
            " ".normal()
        };
        println!(
            "{} {} {} {}",
            marker,
            thread.id.cyan(),
            thread.title.bright_white(),
            thread_preview(thread).dimmed()
        );
    }
}

fn thread_preview(thread: &Conversation) -> String {
    match thread.messages.last() {
        Some(last) if last.status != DeliveryStatus::Delivered => {
            format!("{} [{}]", last.body, last.status.label())
        }
        Some(last) => last.body.clone(),
        None => thread
            .last_preview
            .clone()
            .unwrap_or_else(|| "No messages yet".to_string()),
    }
}

fn print_answer(answer: &AgentResponsePayload) {
    println!("{} {}", "AI:".bright_magenta().bold(), answer.answer_text());
    for listing in &answer.results {
        let price = listing
            .price
            .map(|p| format!("${:.2}", p))
            .unwrap_or_default();
        println!("  {} {} {}", "•".cyan(), listing.title, price.green());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_text_is_chat() {
        assert_eq!(parse_command("  hello there "), Command::Say("hello there".into()));
        assert_eq!(parse_command("   "), Command::Empty);
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("/search red bike"), Command::Search("red bike".into()));
        assert_eq!(parse_command("/ask anything cheap?"), Command::Ask("anything cheap?".into()));
        assert_eq!(
            parse_command("/open u2 listing-7"),
            Command::Open {
                user_id: "u2".into(),
                listing_id: Some("listing-7".into())
            }
        );
        assert_eq!(
            parse_command("/open u2"),
            Command::Open {
                user_id: "u2".into(),
                listing_id: None
            }
        );
        assert_eq!(parse_command("/select conv-1"), Command::Select("conv-1".into()));
        assert_eq!(parse_command("/threads"), Command::Threads);
        assert_eq!(parse_command("/quit"), Command::Quit);
    }

    #[test]
    fn test_parse_rejects_missing_arguments() {
        assert!(matches!(parse_command("/search"), Command::Invalid(_)));
        assert!(matches!(parse_command("/open"), Command::Invalid(_)));
        assert!(matches!(parse_command("/select   "), Command::Invalid(_)));
        assert!(matches!(parse_command("/dance"), Command::Invalid(_)));
    }
}
