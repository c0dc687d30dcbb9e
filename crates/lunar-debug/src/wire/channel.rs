use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot, Notify},
};
use tokio_util::sync::CancellationToken;

use super::codec::{
    write_command, Command, CommandName, PauseLocation, Response, ResponseReader, Status,
    DEFAULT_MAX_BODY_BYTES,
};
use crate::{
    error::{DebugError, Result},
    poison::lock,
};

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// How long a written command may wait for its reply before the
    /// connection is declared dead.
    pub reply_timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(10),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Frames that are not replies to a request.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// `after` is the id of the last command written before the frame was
    /// read, so a pause can be ordered against later resumes.
    Paused { location: PauseLocation, after: u64 },
    Output(String),
    /// An error status arrived with no command in flight.
    DebuggeeError(String),
    /// Emitted exactly once, after every outstanding request has been failed.
    Closed(DebugError),
}

/// Half-duplex command channel to a debuggee.
///
/// At most one command is on the wire at a time. Later submissions wait in a
/// FIFO queue and replies are delivered to callers in submission order.
#[derive(Clone)]
pub struct CommandChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

type ReplySender = oneshot::Sender<Result<String>>;

struct Inner {
    queue: Mutex<Queue>,
    wake: Notify,
    shutdown: CancellationToken,
    events: mpsc::UnboundedSender<ChannelEvent>,
    next_id: AtomicU64,
    config: ChannelConfig,
}

#[derive(Default)]
struct Queue {
    waiting: VecDeque<Queued>,
    in_flight: Option<InFlight>,
    /// Id of the most recent command moved onto the wire.
    last_sent: u64,
    closed: bool,
}

struct Queued {
    id: u64,
    name: CommandName,
    bytes: Vec<u8>,
    reply: ReplySender,
}

struct InFlight {
    id: u64,
    name: CommandName,
    reply: ReplySender,
}

impl CommandChannel {
    /// Takes ownership of `stream` and starts the reader and writer tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open<S>(
        stream: S,
        config: ChannelConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            queue: Mutex::new(Queue::default()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            events,
            next_id: AtomicU64::new(1),
            config,
        });

        let reader = ResponseReader::new(reader, inner.config.max_body_bytes);
        tokio::spawn(read_loop(reader, inner.clone()));
        tokio::spawn(write_loop(writer, inner.clone()));

        (Self { inner }, events_rx)
    }

    /// Queues `command` and returns a handle resolving to its reply body.
    pub fn submit(&self, command: Command) -> Result<ReplyHandle> {
        let bytes = command.encode()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut queue = lock(&self.inner.queue, "CommandChannel::submit");
            if queue.closed {
                return Err(DebugError::ChannelClosed);
            }
            queue.waiting.push_back(Queued {
                id,
                name: command.name(),
                bytes,
                reply: tx,
            });
        }
        tracing::trace!(target: "lunar.debug", id, command = %command.name(), "queued command");
        self.inner.wake.notify_one();

        Ok(ReplyHandle {
            id,
            rx,
            inner: Arc::downgrade(&self.inner),
        })
    }

    pub async fn request(&self, command: Command) -> Result<String> {
        self.submit(command)?.await
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.queue, "CommandChannel::is_closed").closed
    }

    /// Number of commands submitted but not yet answered.
    pub fn pending(&self) -> usize {
        let queue = lock(&self.inner.queue, "CommandChannel::pending");
        queue.waiting.len() + usize::from(queue.in_flight.is_some())
    }

    /// Fails every outstanding request and drops the connection.
    pub fn close(&self) {
        self.inner.fail(DebugError::ChannelClosed);
    }

    /// Cancelled once the channel has shut down for any reason.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }
}

/// Resolves to the reply for one submitted command.
///
/// Dropping the handle does not withdraw the command; use [`ReplyHandle::cancel`].
#[derive(Debug)]
pub struct ReplyHandle {
    id: u64,
    rx: oneshot::Receiver<Result<String>>,
    inner: Weak<Inner>,
}

impl ReplyHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Withdraws the command if it has not been written yet.
    ///
    /// Once the command is on the wire its reply must still be consumed, so
    /// the handle is given back and will resolve normally.
    pub fn cancel(self) -> std::result::Result<(), ReplyHandle> {
        if let Some(inner) = self.inner.upgrade() {
            let mut queue = lock(&inner.queue, "ReplyHandle::cancel");
            if let Some(pos) = queue.waiting.iter().position(|q| q.id == self.id) {
                queue.waiting.remove(pos);
                tracing::trace!(target: "lunar.debug", id = self.id, "cancelled queued command");
                return Ok(());
            }
        }
        Err(self)
    }
}

impl Future for ReplyHandle {
    type Output = Result<String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(DebugError::ChannelClosed)))
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner").finish_non_exhaustive()
    }
}

impl Inner {
    /// Moves the head of the queue in flight, if the wire is free.
    fn next_to_send(&self) -> Option<(u64, CommandName, Vec<u8>)> {
        let mut queue = lock(&self.queue, "Inner::next_to_send");
        if queue.closed || queue.in_flight.is_some() {
            return None;
        }
        let next = queue.waiting.pop_front()?;
        queue.last_sent = next.id;
        queue.in_flight = Some(InFlight {
            id: next.id,
            name: next.name,
            reply: next.reply,
        });
        Some((next.id, next.name, next.bytes))
    }

    fn last_sent(&self) -> u64 {
        lock(&self.queue, "Inner::last_sent").last_sent
    }

    fn in_flight_id(&self) -> Option<u64> {
        lock(&self.queue, "Inner::in_flight_id")
            .in_flight
            .as_ref()
            .map(|f| f.id)
    }

    /// Completes the in-flight command if `accepts` agrees. Returns whether a
    /// command was completed.
    fn finish_in_flight(
        &self,
        accepts: impl FnOnce(CommandName) -> bool,
        result: Result<String>,
    ) -> bool {
        let in_flight = {
            let mut queue = lock(&self.queue, "Inner::finish_in_flight");
            let accepted = queue.in_flight.as_ref().is_some_and(|f| accepts(f.name));
            if accepted {
                queue.in_flight.take()
            } else {
                None
            }
        };
        let Some(in_flight) = in_flight else {
            return false;
        };

        tracing::trace!(
            target: "lunar.debug",
            id = in_flight.id,
            command = %in_flight.name,
            ok = result.is_ok(),
            "reply delivered"
        );
        // The caller may have dropped its handle; the reply is still consumed.
        let _ = in_flight.reply.send(result);
        self.wake.notify_one();
        true
    }

    fn dispatch(&self, response: Response) -> Result<()> {
        tracing::trace!(
            target: "lunar.debug",
            status = response.status.code(),
            len = response.body.len(),
            "received frame"
        );
        match response.status {
            Status::Output => {
                let _ = self.events.send(ChannelEvent::Output(response.body));
            }
            Status::Paused => {
                let location = PauseLocation::parse(&response.body)?;
                let after = self.last_sent();
                let _ = self.events.send(ChannelEvent::Paused { location, after });
                self.finish_in_flight(CommandName::is_answered_by_pause, Ok(response.body));
            }
            Status::Ok | Status::Running => {
                if !self.finish_in_flight(|_| true, Ok(response.body)) {
                    tracing::warn!(
                        target: "lunar.debug",
                        status = response.status.code(),
                        "dropping reply with no command in flight"
                    );
                }
            }
            Status::BadRequest | Status::Error => {
                let message = response.body.trim_end().to_string();
                let err = DebugError::Debuggee {
                    status: response.status.code(),
                    message: message.clone(),
                };
                if !self.finish_in_flight(|_| true, Err(err)) {
                    let _ = self.events.send(ChannelEvent::DebuggeeError(message));
                }
            }
        }
        Ok(())
    }

    /// Closes the channel, failing everything outstanding with `err`.
    /// Later calls are no-ops.
    fn fail(&self, err: DebugError) {
        let (in_flight, waiting) = {
            let mut queue = lock(&self.queue, "Inner::fail");
            if queue.closed {
                return;
            }
            queue.closed = true;
            (queue.in_flight.take(), std::mem::take(&mut queue.waiting))
        };
        self.shutdown.cancel();

        let outstanding = waiting.len() + usize::from(in_flight.is_some());
        if matches!(err, DebugError::ChannelClosed) {
            tracing::debug!(target: "lunar.debug", outstanding, "command channel closed");
        } else {
            tracing::warn!(
                target: "lunar.debug",
                outstanding,
                error = %err,
                "debuggee connection lost"
            );
        }

        if let Some(in_flight) = in_flight {
            let _ = in_flight.reply.send(Err(err.clone()));
        }
        for queued in waiting {
            let _ = queued.reply.send(Err(err.clone()));
        }
        let _ = self.events.send(ChannelEvent::Closed(err));
    }
}

async fn read_loop<R: AsyncRead + Unpin>(mut reader: ResponseReader<R>, inner: Arc<Inner>) {
    loop {
        let response = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            res = reader.read_response() => res,
        };
        if let Err(err) = response.and_then(|response| inner.dispatch(response)) {
            inner.fail(err);
            return;
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, inner: Arc<Inner>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.wake.notified() => {}
        }

        while let Some((id, name, bytes)) = inner.next_to_send() {
            tracing::trace!(
                target: "lunar.debug",
                id,
                line = %String::from_utf8_lossy(&bytes).trim_end(),
                "sending command"
            );
            let written = tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                res = tokio::time::timeout(
                    inner.config.reply_timeout,
                    write_command(&mut writer, &bytes),
                ) => res,
            };
            match written {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    inner.fail(err.into());
                    return;
                }
                Err(_elapsed) => {
                    tracing::warn!(
                        target: "lunar.debug",
                        id,
                        command = %name,
                        "timed out writing command"
                    );
                    inner.fail(DebugError::Timeout);
                    return;
                }
            }
            tokio::spawn(reply_watchdog(inner.clone(), id));
        }
    }
    let _ = writer.shutdown().await;
}

async fn reply_watchdog(inner: Arc<Inner>, id: u64) {
    tokio::select! {
        _ = inner.shutdown.cancelled() => {}
        _ = tokio::time::sleep(inner.config.reply_timeout) => {
            if inner.in_flight_id() == Some(id) {
                tracing::warn!(
                    target: "lunar.debug",
                    id,
                    timeout_ms = inner.config.reply_timeout.as_millis() as u64,
                    "no reply from debuggee"
                );
                inner.fail(DebugError::Timeout);
            }
        }
    }
}
