use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use super::codec::{encode_response, CommandName, PauseLocation, Status};
use crate::poison::lock;

/// A scripted debuggee used by unit and integration tests.
///
/// It serves one connection at a time and answers the command set the client
/// speaks, with canned evaluation results and a synthetic call stack.
pub struct MockDebuggee {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

#[derive(Clone, Debug)]
pub struct MockDebuggeeConfig {
    /// Where the debuggee reports being stopped.
    pub start: PauseLocation,
    /// Send `PAUSED` as soon as a client connects.
    pub pause_on_connect: bool,
    /// Location reported after `RUN`; `None` keeps running silently.
    pub run_pauses_at: Option<PauseLocation>,
    /// Step commands end the program instead of pausing on the next line.
    pub steps_terminate: bool,
    /// `EXEC` expression (without `return `) to reply body, or error text.
    pub evaluations: HashMap<String, Result<String, String>>,
    /// Body sent for `STACK`.
    pub stack: String,
    /// Reply delays keyed by command.
    pub delayed_replies: Vec<(CommandName, Duration)>,
    /// Commands that are read but never answered.
    pub silent: Vec<CommandName>,
    /// `SETB` fails with this message.
    pub reject_breakpoints: Option<String>,
}

impl Default for MockDebuggeeConfig {
    fn default() -> Self {
        Self {
            start: PauseLocation::new("main.lua", 1),
            pause_on_connect: false,
            run_pauses_at: None,
            steps_terminate: false,
            evaluations: HashMap::new(),
            stack: "{}".to_string(),
            delayed_replies: Vec::new(),
            silent: Vec::new(),
            reject_breakpoints: None,
        }
    }
}

impl MockDebuggeeConfig {
    pub fn evaluate(mut self, expression: &str, body: &str) -> Self {
        self.evaluations
            .insert(expression.to_string(), Ok(body.to_string()));
        self
    }

    pub fn evaluate_error(mut self, expression: &str, message: &str) -> Self {
        self.evaluations
            .insert(expression.to_string(), Err(message.to_string()));
        self
    }
}

/// What crossed the wire, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockLogEntry {
    Received(String),
    Replied(String),
    Pushed(String),
}

enum Push {
    Frame(Vec<u8>),
    Disconnect,
}

struct State {
    config: MockDebuggeeConfig,
    location: Mutex<PauseLocation>,
    log: Mutex<Vec<MockLogEntry>>,
    connections: AtomicUsize,
    pushes_tx: mpsc::UnboundedSender<Push>,
    pushes_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Push>>,
}

impl State {
    fn new(config: MockDebuggeeConfig) -> Self {
        let (pushes_tx, pushes_rx) = mpsc::unbounded_channel();
        Self {
            location: Mutex::new(config.start.clone()),
            config,
            log: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            pushes_tx,
            pushes_rx: tokio::sync::Mutex::new(pushes_rx),
        }
    }

    fn record(&self, entry: MockLogEntry) {
        lock(&self.log, "MockDebuggee::record").push(entry);
    }
}

impl MockDebuggee {
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(MockDebuggeeConfig::default()).await
    }

    /// Listens on an ephemeral loopback port for a debugger to attach.
    pub async fn spawn_with_config(config: MockDebuggeeConfig) -> std::io::Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let state = Arc::new(State::new(config));
        let task_shutdown = shutdown.clone();
        let task_state = state.clone();

        tokio::spawn(async move {
            let _ = accept_loop(listener, task_state, task_shutdown).await;
        });

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    /// Connects out to a listening debugger, the way a game started with
    /// `require("mobdebug").start()` does.
    pub async fn connect(addr: SocketAddr, config: MockDebuggeeConfig) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let local = stream.local_addr()?;
        let shutdown = CancellationToken::new();
        let state = Arc::new(State::new(config));

        let task_shutdown = shutdown.clone();
        let task_state = state.clone();
        tokio::spawn(async move {
            let _ = serve(stream, &task_state, &task_shutdown).await;
        });

        Ok(Self {
            addr: local,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Command lines received so far, without their newline.
    pub fn received(&self) -> Vec<String> {
        lock(&self.state.log, "MockDebuggee::received")
            .iter()
            .filter_map(|entry| match entry {
                MockLogEntry::Received(line) => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn log(&self) -> Vec<MockLogEntry> {
        lock(&self.state.log, "MockDebuggee::log").clone()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn push_paused(&self, file: &str, line: u32) {
        *lock(&self.state.location, "MockDebuggee::push_paused") = PauseLocation::new(file, line);
        self.push(Status::Paused, &format!("{file} {line}"));
    }

    pub fn push_output(&self, text: &str) {
        self.push(Status::Output, text);
    }

    pub fn push_error(&self, message: &str) {
        self.push(Status::Error, message);
    }

    /// Writes arbitrary bytes, e.g. a malformed or truncated frame.
    pub fn push_raw(&self, bytes: &[u8]) {
        let _ = self.state.pushes_tx.send(Push::Frame(bytes.to_vec()));
    }

    pub fn disconnect(&self) {
        let _ = self.state.pushes_tx.send(Push::Disconnect);
    }

    fn push(&self, status: Status, body: &str) {
        let _ = self
            .state
            .pushes_tx
            .send(Push::Frame(encode_response(status, body)));
    }
}

impl Drop for MockDebuggee {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<State>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    loop {
        let (socket, _) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accept = listener.accept() => accept?,
        };
        serve(socket, &state, &shutdown).await?;
    }
}

async fn serve(
    socket: TcpStream,
    state: &State,
    shutdown: &CancellationToken,
) -> std::io::Result<()> {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let (reader, writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut pushes = state.pushes_rx.lock().await;
    let mut conn = Connection { writer, state };

    if state.config.pause_on_connect {
        let location = lock(&state.location, "serve").clone();
        conn.send(Status::Paused, &location.to_string(), false).await?;
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            push = pushes.recv() => match push {
                Some(Push::Frame(bytes)) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    state.record(MockLogEntry::Pushed(text));
                    conn.writer.write_all(&bytes).await?;
                }
                Some(Push::Disconnect) | None => return Ok(()),
            },
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                if !conn.handle(line).await? {
                    return Ok(());
                }
            }
        }
    }
}

struct Connection<'a> {
    writer: OwnedWriteHalf,
    state: &'a State,
}

impl Connection<'_> {
    async fn send(&mut self, status: Status, body: &str, reply: bool) -> std::io::Result<()> {
        let summary = format!("{} {body}", status.code());
        self.state.record(if reply {
            MockLogEntry::Replied(summary)
        } else {
            MockLogEntry::Pushed(summary)
        });
        self.writer.write_all(&encode_response(status, body)).await
    }

    async fn reply(&mut self, status: Status, body: &str) -> std::io::Result<()> {
        self.send(status, body, true).await
    }

    /// Returns `false` once the connection should close.
    async fn handle(&mut self, line: String) -> std::io::Result<bool> {
        let line = line.trim_end_matches('\r').to_string();
        self.state.record(MockLogEntry::Received(line.clone()));

        let (name, rest) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        let Some(command) = CommandName::from_wire(name) else {
            self.reply(Status::BadRequest, "Bad Request").await?;
            return Ok(true);
        };

        let state = self.state;
        let config = &state.config;
        if let Some((_, delay)) = config.delayed_replies.iter().find(|(c, _)| *c == command) {
            tokio::time::sleep(*delay).await;
        }
        if config.silent.contains(&command) {
            return Ok(true);
        }

        match command {
            CommandName::Run => {
                self.reply(Status::Ok, "").await?;
                if let Some(location) = config.run_pauses_at.clone() {
                    *lock(&state.location, "handle RUN") = location.clone();
                    self.send(Status::Paused, &location.to_string(), false).await?;
                }
            }
            CommandName::Step | CommandName::Over | CommandName::Out => {
                self.reply(Status::Ok, "").await?;
                if config.steps_terminate {
                    return Ok(false);
                }
                let location = {
                    let mut location = lock(&state.location, "handle step");
                    location.line += 1;
                    location.clone()
                };
                self.send(Status::Paused, &location.to_string(), false).await?;
            }
            CommandName::Suspend => {
                let location = lock(&state.location, "handle SUSPEND").clone();
                self.reply(Status::Paused, &location.to_string()).await?;
            }
            CommandName::SetBreakpoint => match &config.reject_breakpoints {
                Some(message) => self.reply(Status::BadRequest, message).await?,
                None => self.reply(Status::Ok, "").await?,
            },
            CommandName::Exec => {
                let chunk = rest.rsplit_once(" --{").map_or(rest, |(chunk, _)| chunk);
                let expression = chunk.strip_prefix("return ").unwrap_or(chunk);
                match config.evaluations.get(expression) {
                    Some(Ok(body)) => self.reply(Status::Ok, body).await?,
                    Some(Err(message)) => self.reply(Status::Error, message).await?,
                    None => {
                        let message =
                            format!("[string \"{chunk}\"]:1: attempt to call a nil value");
                        self.reply(Status::Error, &message).await?
                    }
                }
            }
            CommandName::Stack => {
                let body = config.stack.clone();
                self.reply(Status::Ok, &body).await?;
            }
            CommandName::DeleteBreakpoint | CommandName::BaseDir | CommandName::Output => {
                self.reply(Status::Ok, "").await?;
            }
            CommandName::Done | CommandName::Exit => {
                self.reply(Status::Ok, "").await?;
                return Ok(false);
            }
        }
        Ok(true)
    }
}
