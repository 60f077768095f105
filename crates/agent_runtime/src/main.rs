use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use agent_client::{InputMode, UiEvent};
use agent_client_mock::{AgentAction, ScriptedAgentClient, ScriptedAgentTurn};
use agent_runtime::commands::parse_control;
use agent_runtime::demo::DemoViewer;
use agent_runtime::strategy::ResumableStrategy;
use agent_runtime::{
    build_strategy, AgentRuntime, ChatSession, Credentials, HostThread, RuntimeConfig,
    TurnStrategy,
};
use chat_store::ChatStore;
use signal_hook::consts::SIGINT;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(30);
const OFFLINE_REPLY: &str =
    "Offline mode: no model is attached. Use /cli <command> to drive the demo viewer.";

enum Input {
    Line(String),
    Eof,
}

/// Plain runtime, or a runtime whose transcript is persisted to a chat store.
enum Front {
    Plain(AgentRuntime),
    Persisted(Box<ChatSession>),
}

impl Front {
    fn runtime(&self) -> &AgentRuntime {
        match self {
            Self::Plain(runtime) => runtime,
            Self::Persisted(session) => session.runtime(),
        }
    }

    fn pump(&mut self) -> io::Result<Vec<UiEvent>> {
        match self {
            Self::Plain(runtime) => Ok(runtime.drain_events(Some(runtime.config().ui_event_batch))),
            Self::Persisted(session) => session.pump(Instant::now()).map_err(io::Error::other),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(_) => Ok(()),
            Self::Persisted(session) => session.close().map_err(io::Error::other),
        }
    }
}

fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let offline = std::env::args().skip(1).any(|arg| arg == "--offline");
    let config = RuntimeConfig::from_env();
    let host = Arc::new(HostThread::spawn(DemoViewer::new()).map_err(io::Error::other)?);

    let offline_client = offline.then(|| Arc::new(ScriptedAgentClient::default()));
    let credentials = if offline {
        Credentials::fixed(Some("offline"))
    } else {
        Credentials::from_env()
    };
    let strategy: Arc<dyn TurnStrategy> = match &offline_client {
        Some(client) => Arc::new(ResumableStrategy::new(Arc::<ScriptedAgentClient>::clone(client))),
        None => build_strategy(&config, &credentials),
    };

    let chat_root = config.chat_root.clone();
    let runtime = AgentRuntime::new(config, Arc::<HostThread>::clone(&host), strategy, Arc::new(credentials));
    runtime.ensure_ai_default_mode(true);
    let mut front = match chat_root {
        Some(root) => {
            let store = ChatStore::open_with_defaults(root).map_err(io::Error::other)?;
            Front::Persisted(Box::new(ChatSession::new(runtime, store)))
        }
        None => Front::Plain(runtime),
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&interrupted))?;
    let lines = spawn_stdin_reader()?;

    let profile = front.runtime().profile();
    println!(
        "mol-agent ({} / {}). Type /ai help, /cli help, or /quit.",
        profile.client_id,
        front.runtime().model()
    );

    let mut stdout = io::stdout();
    let mut mid_stream = false;
    loop {
        if interrupted.swap(false, Ordering::SeqCst) && !front.runtime().request_cancel() {
            println!("(nothing to cancel; type /quit to exit)");
        }

        match lines.recv_timeout(POLL_INTERVAL) {
            Ok(Input::Line(line)) => {
                let trimmed = line.trim();
                if trimmed == "/quit" || trimmed == "/exit" {
                    break;
                }
                if let Some(client) = &offline_client {
                    let runtime = front.runtime();
                    if runtime.is_enabled()
                        && runtime.input_mode() == InputMode::Ai
                        && !trimmed.is_empty()
                        && parse_control(trimmed).is_none()
                    {
                        client.push_turn(ScriptedAgentTurn::new(vec![AgentAction::Text(
                            OFFLINE_REPLY.to_string(),
                        )]));
                    }
                }
                front.runtime().submit(trimmed);
            }
            Ok(Input::Eof) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        for event in front.pump()? {
            mid_stream = render(&mut stdout, &event, mid_stream)?;
        }
    }

    front.runtime().request_cancel();
    front.runtime().wait_idle(Duration::from_secs(5));
    for event in front.pump()? {
        mid_stream = render(&mut stdout, &event, mid_stream)?;
    }
    if mid_stream {
        writeln!(stdout)?;
    }
    front.close()?;
    host.shutdown();
    Ok(())
}

fn spawn_stdin_reader() -> io::Result<mpsc::Receiver<Input>> {
    let (sender, receiver) = mpsc::channel();
    thread::Builder::new()
        .name("mol-agent-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if sender.send(Input::Line(line)).is_err() {
                    return;
                }
            }
            let _ = sender.send(Input::Eof);
        })?;
    Ok(receiver)
}

/// Prints one event. Stream chunks are written inline; returns whether the
/// cursor is left mid-line.
fn render(out: &mut impl Write, event: &UiEvent, mid_stream: bool) -> io::Result<bool> {
    if event.is_stream_chunk() {
        if !mid_stream {
            write!(out, "{}", UiEvent::ai("").console_line())?;
        }
        write!(out, "{}", event.text)?;
        out.flush()?;
        return Ok(true);
    }
    if mid_stream {
        writeln!(out)?;
    }
    writeln!(out, "{}", event.console_line())?;
    Ok(false)
}
