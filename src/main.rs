use std::io::Write;

use chat_client::markup::{self, Segment};
use chat_client::models::ChatTurn;
use chat_client::{ApiClient, ClientConfig, Delivery, StreamConsumer, StreamingMarkup, TurnEvent, TurnHandle};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const HELP: &str = "Commands: /new, /sessions, /open <id>, /models, /attach <id>, /retry, /quit. \
                    Ctrl-C cancels a reply in progress, or quits at the prompt.";

/// What the user typed on one line.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Prompt(String),
    New,
    Sessions,
    Open(String),
    Models,
    Attach(String),
    Retry,
    Help,
    Quit,
    Empty,
}

impl Command {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Command::Prompt(line.to_string());
        };
        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (command, ""),
        };
        match (name, arg) {
            ("new", _) => Command::New,
            ("sessions", _) => Command::Sessions,
            ("open", id) if !id.is_empty() => Command::Open(id.to_string()),
            ("models", _) => Command::Models,
            ("attach", id) if !id.is_empty() => Command::Attach(id.to_string()),
            ("retry", _) => Command::Retry,
            ("quit" | "exit", _) => Command::Quit,
            _ => Command::Help,
        }
    }
}

/// Conversation state the terminal keeps between turns.
#[derive(Default)]
struct Session {
    session_id: Option<String>,
    attachments: Vec<String>,
    failed: Option<ChatTurn>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    // Logs go to stderr; stdout carries the conversation
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_client=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ClientConfig::from_env();
    info!("Chatting with {} using model {}", config.base_url, config.model);

    let consumer = StreamConsumer::new(ApiClient::new(config)?);
    let api = consumer.api().clone();
    let mut session = Session::default();

    eprintln!("{HELP}");
    let mut interrupts = forward_interrupts();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    show_prompt();

    while let Some(line) = read_line(&mut lines, &mut interrupts).await? {
        match Command::parse(&line) {
            Command::Quit => break,
            Command::Empty => {}
            Command::Help => eprintln!("{HELP}"),
            Command::New => match api.new_chat().await {
                Ok(id) => {
                    eprintln!("Started session {id}");
                    session.session_id = Some(id);
                }
                Err(e) => eprintln!("Could not start a new chat: {e}"),
            },
            Command::Sessions => match api.fetch_sessions().await {
                Ok(sessions) if sessions.is_empty() => eprintln!("No conversations yet"),
                Ok(sessions) => {
                    for s in sessions {
                        let title = s.title.unwrap_or_else(|| "Untitled chat".to_string());
                        println!("{}  {title} ({} messages)", s.id, s.message_count);
                    }
                }
                Err(e) => eprintln!("Could not load sessions: {e}"),
            },
            Command::Open(id) => match api.fetch_messages(&id).await {
                Ok(messages) => {
                    for m in messages {
                        let sender = m.sender.as_deref().unwrap_or("ai");
                        println!("[{sender}]\n{}", render(&markup::parse(&m.text)));
                    }
                    session.session_id = Some(id);
                }
                Err(e) => eprintln!("Could not load messages: {e}"),
            },
            Command::Models => match api.fetch_models().await {
                Ok(models) => models.iter().for_each(|m| println!("{m}")),
                Err(e) => eprintln!("Could not load models: {e}"),
            },
            Command::Attach(id) => {
                eprintln!("Attachment {id} will be sent with the next message");
                session.attachments.push(id);
            }
            Command::Retry => match session.failed.take() {
                Some(turn) => match consumer.resend(&turn) {
                    Ok(handle) => present(handle, &mut session, &api, &mut interrupts).await,
                    Err(e) => {
                        eprintln!("{e}");
                        session.failed = Some(turn);
                    }
                },
                None => eprintln!("Nothing to retry"),
            },
            Command::Prompt(text) => {
                let attachments = std::mem::take(&mut session.attachments);
                match consumer.send(text, attachments.clone(), session.session_id.clone()) {
                    Ok(handle) => present(handle, &mut session, &api, &mut interrupts).await,
                    Err(e) => {
                        eprintln!("{e}");
                        session.attachments = attachments;
                    }
                }
            }
        }
        show_prompt();
    }

    Ok(())
}

fn show_prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

/// Turns every Ctrl-C of the process into a message. One handler serves both
/// the idle prompt and a running turn.
fn forward_interrupts() -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(()).is_err() {
                break;
            }
        }
    });
    rx
}

/// Next input line. `None` at end of input or on Ctrl-C.
async fn read_line<R: AsyncBufRead + Unpin>(
    lines: &mut Lines<R>,
    interrupts: &mut mpsc::UnboundedReceiver<()>,
) -> std::io::Result<Option<String>> {
    tokio::select! {
        line = lines.next_line() => line,
        Some(()) = interrupts.recv() => Ok(None),
    }
}

enum Step {
    Event(Option<TurnEvent>),
    Interrupted,
}

/// Shows one turn: a live status line while streaming, the rendered reply at the end.
async fn present(
    mut handle: TurnHandle,
    session: &mut Session,
    api: &ApiClient,
    interrupts: &mut mpsc::UnboundedReceiver<()>,
) {
    let mut markup = StreamingMarkup::new();
    loop {
        let step = tokio::select! {
            event = handle.next_event() => Step::Event(event),
            Some(()) = interrupts.recv() => Step::Interrupted,
        };
        let event = match step {
            Step::Event(Some(event)) => event,
            Step::Event(None) => break,
            Step::Interrupted => {
                handle.abort();
                break;
            }
        };
        match event {
            TurnEvent::Progress { text, .. } => {
                let blocks = markup.update(&text).iter().filter(|s| s.segment.is_code_block()).count();
                eprint!("\r\x1b[2K… {} chars, {blocks} code blocks", text.chars().count());
            }
            TurnEvent::Completed { turn, delivery } => {
                eprint!("\r\x1b[2K");
                if delivery == Delivery::Fallback {
                    debug!("Reply arrived through the non-streaming endpoint");
                }
                println!("{}", render(&markup::parse(turn.accumulated_text())));
                session.session_id = turn.session_id().map(str::to_string);
                session.failed = None;
                refresh_history(api.clone());
            }
            TurnEvent::Failed { turn, error } => {
                eprintln!("\r\x1b[2KFailed to send message: {error}. Type /retry to send it again.");
                session.failed = Some(turn);
            }
        }
    }

    if handle.is_aborted() {
        eprintln!("\r\x1b[2K(cancelled)");
    }
}

/// Fire-and-forget reload of the session list after a completed turn.
fn refresh_history(api: ApiClient) {
    tokio::spawn(async move {
        match api.fetch_sessions().await {
            Ok(sessions) => debug!("History refreshed: {} sessions", sessions.len()),
            Err(e) => warn!("History refresh failed: {e}"),
        }
    });
}

fn render(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::PlainText(text) => out.push_str(text),
            Segment::InlineCode(code) => {
                out.push('`');
                out.push_str(code);
                out.push('`');
            }
            Segment::CodeBlock { language, content } => {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&format!("┌─ {language}\n"));
                for line in content.lines() {
                    out.push_str("│ ");
                    out.push_str(line);
                    out.push('\n');
                }
                out.push_str("└─\n");
            }
        }
    }
    out
}
