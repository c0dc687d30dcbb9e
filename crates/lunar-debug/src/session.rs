use std::{
    collections::BTreeSet,
    fmt,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use lunar_literal::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::{broadcast, mpsc},
};

use crate::{
    error::{DebugError, ErrorKind, Result},
    evaluate::Evaluator,
    poison::lock,
    stack::{decode_stack, stack_command, StackFrame},
    wire::{
        ChannelConfig, ChannelEvent, Command, CommandChannel, CommandName, PauseLocation,
        DEFAULT_MAX_BODY_BYTES,
    },
};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub reply_timeout: Duration,
    /// Table nesting depth requested from, and accepted back from, the debuggee.
    pub max_depth: usize,
    pub max_body_bytes: usize,
    /// Sent as `BASEDIR` during the handshake.
    pub basedir: Option<String>,
    pub event_channel_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(10),
            max_depth: 8,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            basedir: None,
            event_channel_size: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Running,
    Paused,
    Stepping,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Stepping => "stepping",
            SessionState::Terminated => "terminated",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Breakpoint {
    pub file: String,
    pub line: u32,
}

impl fmt::Display for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Into,
    Over,
    Out,
}

impl StepKind {
    fn command(self) -> CommandName {
        match self {
            StepKind::Into => CommandName::Step,
            StepKind::Over => CommandName::Over,
            StepKind::Out => CommandName::Out,
        }
    }

    fn operation(self) -> &'static str {
        match self {
            StepKind::Into => "step into",
            StepKind::Over => "step over",
            StepKind::Out => "step out",
        }
    }
}

/// Output streams the debuggee can forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
}

impl OutputStream {
    fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
        }
    }
}

/// What the debuggee does with `print` and `io.write` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Print locally and forward a copy.
    Copy,
    /// Forward only.
    Redirect,
    /// Stop forwarding.
    Default,
}

impl OutputMode {
    fn flag(self) -> char {
        match self {
            OutputMode::Copy => 'c',
            OutputMode::Redirect => 'r',
            OutputMode::Default => 'd',
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub frame: usize,
    pub location: Option<PauseLocation>,
    pub breakpoints: Vec<Breakpoint>,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionSnapshot),
    /// Program output forwarded by the debuggee.
    Output(String),
    /// An error the debuggee reported outside any request.
    DebuggeeError(String),
}

/// A debugging session with one debuggee.
///
/// Clones share the session. All operations may be called from any task;
/// requests are serialized on the underlying [`CommandChannel`].
#[derive(Clone)]
pub struct DebugSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: SessionConfig,
    core: Mutex<Core>,
    events: broadcast::Sender<SessionEvent>,
}

struct Core {
    state: SessionState,
    frame: usize,
    location: Option<PauseLocation>,
    breakpoints: BTreeSet<Breakpoint>,
    channel: Option<CommandChannel>,
    /// Command id of the latest `RUN`/step; pauses read before it was sent
    /// are stale.
    resumed_at: u64,
    /// Set once the session's single connection has been given up.
    ended: bool,
}

impl Core {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            frame: self.frame,
            location: self.location.clone(),
            breakpoints: self.breakpoints.iter().cloned().collect(),
        }
    }

    fn invalid(&self, operation: &'static str) -> DebugError {
        DebugError::InvalidState {
            operation,
            state: self.state,
        }
    }

    /// The live channel, provided the session is in one of `allowed`.
    fn channel_in(
        &self,
        operation: &'static str,
        allowed: &[SessionState],
    ) -> Result<CommandChannel> {
        if !allowed.contains(&self.state) {
            return Err(self.invalid(operation));
        }
        self.channel.clone().ok_or_else(|| self.invalid(operation))
    }
}

impl fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugSession")
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl Default for DebugSession {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl DebugSession {
    pub fn new(config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_size.max(1));
        Self {
            inner: Arc::new(SessionInner {
                config,
                core: Mutex::new(Core {
                    state: SessionState::Disconnected,
                    frame: 0,
                    location: None,
                    breakpoints: BTreeSet::new(),
                    channel: None,
                    resumed_at: 0,
                    ended: false,
                }),
                events,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        lock(&self.inner.core, "DebugSession::state").state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot()
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        lock(&self.inner.core, "DebugSession::breakpoints")
            .breakpoints
            .iter()
            .cloned()
            .collect()
    }

    /// Connects to a debuggee listening at `addr`.
    ///
    /// A failed connect leaves the session untouched so the attach can be
    /// retried.
    pub async fn attach<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
        self.ensure_attachable()?;
        let stream = match tokio::time::timeout(
            self.inner.config.connect_timeout,
            TcpStream::connect(addr),
        )
        .await
        {
            Ok(stream) => stream?,
            Err(_elapsed) => return Err(DebugError::Timeout),
        };
        let _ = stream.set_nodelay(true);
        self.attach_stream(stream).await
    }

    /// Waits for a debuggee to connect to `listener`.
    pub async fn attach_listener(&self, listener: &TcpListener) -> Result<()> {
        self.ensure_attachable()?;
        let (stream, peer) = listener.accept().await?;
        tracing::info!(target: "lunar.debug", %peer, "debuggee connected");
        let _ = stream.set_nodelay(true);
        self.attach_stream(stream).await
    }

    /// Runs the handshake over an established stream.
    ///
    /// Breakpoints set before attaching are sent to the debuggee here. If the
    /// handshake fails the session is terminated.
    pub async fn attach_stream<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (channel, events) = CommandChannel::open(
            stream,
            ChannelConfig {
                reply_timeout: self.inner.config.reply_timeout,
                max_body_bytes: self.inner.config.max_body_bytes,
            },
        );

        let pending = {
            let mut core = lock(&self.inner.core, "DebugSession::attach_stream");
            if core.ended || core.channel.is_some() {
                channel.close();
                return Err(core.invalid("attach"));
            }
            core.channel = Some(channel.clone());
            core.state = SessionState::Running;
            self.inner.publish(&core);
            core.breakpoints.iter().cloned().collect::<Vec<_>>()
        };
        tokio::spawn(pump_events(Arc::downgrade(&self.inner), events));

        let handshake = async {
            if let Some(basedir) = &self.inner.config.basedir {
                let command = Command::new(CommandName::BaseDir).with_args(basedir.clone());
                self.inner.handshake_step(channel.request(command).await, None)?;
            }
            for bp in &pending {
                let reply = channel
                    .request(Command::set_breakpoint(&bp.file, bp.line))
                    .await;
                self.inner.handshake_step(reply, Some(bp))?;
            }
            Ok::<_, DebugError>(())
        };
        if let Err(err) = handshake.await {
            tracing::warn!(target: "lunar.debug", error = %err, "handshake failed");
            self.inner.terminate();
            return Err(err);
        }

        tracing::info!(
            target: "lunar.debug",
            breakpoints = self.breakpoints().len(),
            "attached to debuggee"
        );
        Ok(())
    }

    fn ensure_attachable(&self) -> Result<()> {
        let core = lock(&self.inner.core, "DebugSession::ensure_attachable");
        if core.ended || core.channel.is_some() {
            return Err(core.invalid("attach"));
        }
        Ok(())
    }

    pub async fn run(&self) -> Result<()> {
        self.resume(CommandName::Run, SessionState::Running, "run")
            .await
    }

    pub async fn step(&self, kind: StepKind) -> Result<()> {
        self.resume(kind.command(), SessionState::Stepping, kind.operation())
            .await
    }

    pub async fn step_into(&self) -> Result<()> {
        self.step(StepKind::Into).await
    }

    pub async fn step_over(&self) -> Result<()> {
        self.step(StepKind::Over).await
    }

    pub async fn step_out(&self) -> Result<()> {
        self.step(StepKind::Out).await
    }

    /// Leaves `Paused`. The new state is entered before the command is sent so
    /// a fast `PAUSED` from the debuggee is never overwritten.
    async fn resume(
        &self,
        name: CommandName,
        next: SessionState,
        operation: &'static str,
    ) -> Result<()> {
        let (handle, previous) = {
            let mut core = lock(&self.inner.core, "DebugSession::resume");
            let channel = core.channel_in(operation, &[SessionState::Paused])?;
            let handle = channel.submit(Command::new(name))?;
            core.resumed_at = handle.id();
            core.state = next;
            core.frame = 0;
            let previous = core.location.take();
            self.inner.publish(&core);
            (handle, previous)
        };
        tracing::debug!(target: "lunar.debug", command = %name, state = %next, "resuming");

        match handle.await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::Debuggee => {
                let mut core = lock(&self.inner.core, "DebugSession::resume");
                if core.state == next {
                    core.state = SessionState::Paused;
                    core.location = previous;
                    self.inner.publish(&core);
                }
                Err(err)
            }
            Err(err) => {
                if err.kind() == ErrorKind::Network {
                    self.inner.connection_lost(&err);
                }
                Err(err)
            }
        }
    }

    /// Asks a running debuggee to stop and waits until it has.
    pub async fn pause(&self) -> Result<PauseLocation> {
        let handle = {
            let core = lock(&self.inner.core, "DebugSession::pause");
            let channel =
                core.channel_in("pause", &[SessionState::Running, SessionState::Stepping])?;
            channel.submit(Command::new(CommandName::Suspend))?
        };
        let id = handle.id();
        let body = handle.await?;
        let location = PauseLocation::parse(&body)?;
        self.inner.enter_paused(location.clone(), id);
        Ok(location)
    }

    /// Returns `false` if the breakpoint was already set; nothing is sent then.
    ///
    /// Before attaching the breakpoint is only recorded and is sent during the
    /// handshake.
    pub async fn set_breakpoint(&self, file: impl Into<String>, line: u32) -> Result<bool> {
        let bp = Breakpoint {
            file: file.into(),
            line,
        };
        let handle = {
            let mut core = lock(&self.inner.core, "DebugSession::set_breakpoint");
            if core.ended {
                return Err(core.invalid("set a breakpoint"));
            }
            if core.breakpoints.contains(&bp) {
                return Ok(false);
            }
            let handle = match &core.channel {
                Some(channel) => {
                    Some(channel.submit(Command::set_breakpoint(&bp.file, bp.line))?)
                }
                None => None,
            };
            core.breakpoints.insert(bp.clone());
            handle
        };

        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                if err.kind() == ErrorKind::Debuggee {
                    lock(&self.inner.core, "DebugSession::set_breakpoint")
                        .breakpoints
                        .remove(&bp);
                }
                return Err(err);
            }
        }
        tracing::debug!(target: "lunar.debug", breakpoint = %bp, "breakpoint set");
        self.inner.publish(&lock(&self.inner.core, "DebugSession::set_breakpoint"));
        Ok(true)
    }

    /// Returns `false` if no such breakpoint was set.
    pub async fn clear_breakpoint(&self, file: &str, line: u32) -> Result<bool> {
        let bp = Breakpoint {
            file: file.to_string(),
            line,
        };
        let handle = {
            let mut core = lock(&self.inner.core, "DebugSession::clear_breakpoint");
            if core.ended {
                return Err(core.invalid("clear a breakpoint"));
            }
            if !core.breakpoints.contains(&bp) {
                return Ok(false);
            }
            let handle = match &core.channel {
                Some(channel) => Some(channel.submit(Command::delete_breakpoint(file, line))?),
                None => None,
            };
            core.breakpoints.remove(&bp);
            handle
        };

        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                if err.kind() == ErrorKind::Debuggee {
                    lock(&self.inner.core, "DebugSession::clear_breakpoint")
                        .breakpoints
                        .insert(bp);
                }
                return Err(err);
            }
        }
        self.inner
            .publish(&lock(&self.inner.core, "DebugSession::clear_breakpoint"));
        Ok(true)
    }

    /// Chooses the frame that [`DebugSession::evaluate_selected`] runs in.
    pub fn select_frame(&self, frame: usize) -> Result<()> {
        let mut core = lock(&self.inner.core, "DebugSession::select_frame");
        if core.state != SessionState::Paused {
            return Err(core.invalid("select a frame"));
        }
        if core.frame != frame {
            core.frame = frame;
            self.inner.publish(&core);
        }
        Ok(())
    }

    pub fn evaluator(&self) -> Result<Evaluator> {
        let core = lock(&self.inner.core, "DebugSession::evaluator");
        let channel = core.channel_in("evaluate", &[SessionState::Paused])?;
        Ok(Evaluator::new(channel, self.inner.config.max_depth))
    }

    /// Evaluates `expression` in `frame` (0 is the innermost).
    pub async fn evaluate(&self, frame: usize, expression: &str) -> Result<Value> {
        self.evaluator()?.evaluate(frame, expression).await
    }

    pub async fn evaluate_all(&self, frame: usize, expression: &str) -> Result<Vec<Value>> {
        self.evaluator()?.evaluate_all(frame, expression).await
    }

    /// Evaluates in the selected frame.
    pub async fn evaluate_selected(&self, expression: &str) -> Result<Value> {
        let frame = lock(&self.inner.core, "DebugSession::evaluate_selected").frame;
        self.evaluate(frame, expression).await
    }

    /// Callback flavour of [`DebugSession::evaluate`]; exactly one callback runs.
    pub fn evaluate_with<F, E>(&self, frame: usize, expression: &str, on_result: F, on_error: E)
    where
        F: FnOnce(Value) + Send + 'static,
        E: FnOnce(DebugError) + Send + 'static,
    {
        match self.evaluator() {
            Ok(evaluator) => evaluator.evaluate_with(frame, expression, on_result, on_error),
            Err(err) => on_error(err),
        }
    }

    pub async fn stack(&self) -> Result<Vec<StackFrame>> {
        let channel = lock(&self.inner.core, "DebugSession::stack")
            .channel_in("inspect the stack", &[SessionState::Paused])?;
        let max_depth = self.inner.config.max_depth;
        let body = channel.request(stack_command(max_depth)).await?;
        decode_stack(&body, max_depth)
    }

    /// Controls forwarding of the debuggee's output; forwarded text arrives
    /// as [`SessionEvent::Output`].
    pub async fn set_output(&self, stream: OutputStream, mode: OutputMode) -> Result<()> {
        let channel = lock(&self.inner.core, "DebugSession::set_output")
            .channel_in("redirect output", &[SessionState::Paused])?;
        let args = format!("{} {}", stream.as_str(), mode.flag());
        channel
            .request(Command::new(CommandName::Output).with_args(args))
            .await?;
        Ok(())
    }

    /// Lets the program continue without the debugger. Final.
    pub async fn detach(&self) -> Result<()> {
        self.finish("detach", CommandName::Done, SessionState::Disconnected)
            .await
    }

    /// Asks the debuggee to exit. Final.
    pub async fn exit(&self) -> Result<()> {
        self.finish("exit", CommandName::Exit, SessionState::Terminated)
            .await
    }

    async fn finish(
        &self,
        operation: &'static str,
        name: CommandName,
        last: SessionState,
    ) -> Result<()> {
        let handle = {
            let mut core = lock(&self.inner.core, "DebugSession::finish");
            let channel = core.channel_in(
                operation,
                &[SessionState::Running, SessionState::Paused, SessionState::Stepping],
            )?;
            let handle = channel.submit(Command::new(name));
            // Claimed before the debuggee hangs up so the loss of the
            // connection is not reported as a termination.
            core.state = last;
            core.ended = true;
            core.location = None;
            self.inner.publish(&core);
            handle
        };

        let result = match handle {
            Ok(handle) => handle.await.map(drop),
            Err(err) => Err(err),
        };
        let channel = lock(&self.inner.core, "DebugSession::finish").channel.clone();
        if let Some(channel) = channel {
            channel.close();
        }
        tracing::info!(target: "lunar.debug", state = %last, "session finished");
        match result {
            Err(err) if err.kind() == ErrorKind::Network => Ok(()),
            other => other,
        }
    }
}

impl SessionInner {
    fn snapshot(&self) -> SessionSnapshot {
        lock(&self.core, "SessionInner::snapshot").snapshot()
    }

    /// Sent while the core is locked so events arrive in transition order.
    fn publish(&self, core: &Core) {
        // No subscribers is fine.
        let _ = self.events.send(SessionEvent::StateChanged(core.snapshot()));
    }

    /// `after` is the id of the last command sent before the pause was read.
    fn enter_paused(&self, location: PauseLocation, after: u64) {
        {
            let mut core = lock(&self.core, "SessionInner::enter_paused");
            if after < core.resumed_at {
                tracing::trace!(
                    target: "lunar.debug",
                    after,
                    resumed_at = core.resumed_at,
                    "ignoring pause from before the last resume"
                );
                return;
            }
            if !matches!(
                core.state,
                SessionState::Running | SessionState::Stepping | SessionState::Paused
            ) {
                return;
            }
            if core.state == SessionState::Paused && core.location.as_ref() == Some(&location) {
                return;
            }
            core.state = SessionState::Paused;
            core.frame = 0;
            core.location = Some(location);
            self.publish(&core);
        }
        tracing::debug!(target: "lunar.debug", "debuggee paused");
    }

    /// A debuggee rejection during the handshake drops what was rejected and
    /// carries on; anything else aborts the attach.
    fn handshake_step(&self, reply: Result<String>, breakpoint: Option<&Breakpoint>) -> Result<()> {
        let message = match reply {
            Ok(_) => return Ok(()),
            Err(DebugError::Debuggee { message, .. }) => message,
            Err(err) => return Err(err),
        };
        tracing::warn!(
            target: "lunar.debug",
            breakpoint = breakpoint.map(tracing::field::display),
            %message,
            "debuggee rejected handshake command"
        );
        {
            let mut core = lock(&self.core, "SessionInner::handshake_step");
            if let Some(bp) = breakpoint {
                core.breakpoints.remove(bp);
            }
            self.publish(&core);
        }
        let _ = self.events.send(SessionEvent::DebuggeeError(message));
        Ok(())
    }

    fn connection_lost(&self, err: &DebugError) {
        {
            let mut core = lock(&self.core, "SessionInner::connection_lost");
            if core.ended {
                return;
            }
            core.state = SessionState::Terminated;
            core.ended = true;
            core.location = None;
            self.publish(&core);
        }
        tracing::debug!(target: "lunar.debug", error = %err, "session terminated");
    }

    fn terminate(&self) {
        let channel = {
            let mut core = lock(&self.core, "SessionInner::terminate");
            core.state = SessionState::Terminated;
            core.ended = true;
            core.location = None;
            self.publish(&core);
            core.channel.clone()
        };
        if let Some(channel) = channel {
            channel.close();
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let core = lock(&self.core, "SessionInner::drop");
        if let Some(channel) = &core.channel {
            channel.close();
        }
    }
}

async fn pump_events(
    session: Weak<SessionInner>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = session.upgrade() else {
            return;
        };
        match event {
            ChannelEvent::Paused { location, after } => inner.enter_paused(location, after),
            ChannelEvent::Output(text) => {
                let _ = inner.events.send(SessionEvent::Output(text));
            }
            ChannelEvent::DebuggeeError(message) => {
                tracing::warn!(target: "lunar.debug", %message, "debuggee reported an error");
                let _ = inner.events.send(SessionEvent::DebuggeeError(message));
            }
            ChannelEvent::Closed(err) => {
                inner.connection_lost(&err);
                return;
            }
        }
    }
}
