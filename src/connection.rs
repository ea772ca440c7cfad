use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::codec::FrameCodec;
use crate::command::Command;
use crate::config::Config;
use crate::frame::Frame;
use crate::subscription::{self, Expect, PushKind, Sink, SubscriptionState};
use crate::transport::{Network, Transport, TransportReader, TransportWriter};
use crate::value::{self, Destination, Value};
use crate::{Error, Result};

/// How long `close` waits for the server to acknowledge `QUIT`.
const QUIT_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `close` waits for the write half, which another caller may hold while stuck flushing
/// to a peer that stopped reading.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// A client connection multiplexing many requests over one ordered byte stream.
///
/// Replies are matched to requests purely by position: the server answers in the order it received
/// commands, so the connection keeps a FIFO queue of pending requests and completes the oldest one
/// for every reply it decodes. Writing a command and queueing its request happen under one lock, so
/// queue order always equals wire order.
///
/// The handle is cheap to clone; clones share the same socket. Once closed, by the caller or by a
/// fatal error, a connection never reopens.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    writer: AsyncMutex<TransportWriter>,
    shared: Arc<Shared>,
    command_timeout: Option<Duration>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Last handle gone, stop the read loop.
        self.shared.shutdown.cancel();
    }
}

/// State shared between callers and the read loop.
struct Shared {
    id: Uuid,
    peer: String,
    state: Mutex<State>,
    shutdown: CancellationToken,
    subscribed: watch::Sender<bool>,
}

struct State {
    open: bool,
    mode: Mode,
    pending: VecDeque<Pending>,
}

enum Mode {
    Commands,
    /// A subscribe command is queued but not confirmed yet.
    Subscribing,
    Subscribed(SubscriptionState),
}

enum Pending {
    Reply(PendingRequest),
    Subscribe {
        sink: Sink,
        expect: Expect,
        ack: oneshot::Sender<Result<()>>,
    },
    /// A subscribe-class command written while subscribed. Its answers are pushed frames.
    Confirmations(Expect),
}

struct PendingRequest {
    destination: Destination,
    completion: oneshot::Sender<Result<Value>>,
}

impl PendingRequest {
    fn complete(self, frame: Frame) {
        // The caller may have stopped waiting.
        let _ = self.completion.send(value::bind(frame, self.destination));
    }
}

impl Pending {
    fn fail(self, error: Error) {
        match self {
            Pending::Reply(request) => {
                let _ = request.completion.send(Err(error));
            }
            Pending::Subscribe { ack, .. } => {
                let _ = ack.send(Err(error));
            }
            Pending::Confirmations(_) => {}
        }
    }
}

/// Resolves to the reply of a command sent with [`Connection::command_async`].
#[must_use = "dropping the future discards the reply"]
#[derive(Debug)]
pub struct ReplyFuture {
    reply: oneshot::Receiver<Result<Value>>,
}

impl Future for ReplyFuture {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.reply)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(Error::ConnectionClosed)))
    }
}

impl Connection {
    /// Dials `address` over `network`, optionally giving up after `deadline`.
    pub async fn open(
        network: Network,
        address: &str,
        deadline: Option<Duration>,
    ) -> Result<Connection> {
        let transport = Transport::open(network, address, deadline, FrameCodec::default()).await?;
        Ok(Connection::new(transport, None))
    }

    pub async fn open_with(config: &Config) -> Result<Connection> {
        let codec = FrameCodec::new(config.max_frame_size);
        let transport = Transport::open(
            config.network,
            &config.address,
            config.connect_timeout(),
            codec,
        )
        .await?;
        Ok(Connection::new(transport, config.command_timeout()))
    }

    pub async fn connect(address: &str) -> Result<Connection> {
        Connection::open(Network::Tcp, address, None).await
    }

    #[cfg(unix)]
    pub async fn connect_unix(path: &str) -> Result<Connection> {
        Connection::open(Network::Unix, path, None).await
    }

    /// Takes over an established transport and spawns its read loop, so it must be called from
    /// within a Tokio runtime.
    pub fn new(transport: Transport, command_timeout: Option<Duration>) -> Connection {
        let peer = transport.peer().to_string();
        let (reader, writer) = transport.split();
        let (subscribed, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            peer,
            state: Mutex::new(State {
                open: true,
                mode: Mode::Commands,
                pending: VecDeque::new(),
            }),
            shutdown: CancellationToken::new(),
            subscribed,
        });

        info!(connection_id = %shared.id, peer = %shared.peer, "connection open");

        tokio::spawn(read_loop(reader, shared.clone()));

        Connection {
            inner: Arc::new(Inner {
                writer: AsyncMutex::new(writer),
                shared,
                command_timeout,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.shared.id
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.shared.lock().open
    }

    /// `true` from the moment a subscribe command is queued until the server confirms that no
    /// subscription is left.
    pub fn is_subscribed(&self) -> bool {
        !matches!(self.inner.shared.lock().mode, Mode::Commands)
    }

    /// Channels, then patterns, the server has confirmed and not yet released.
    pub fn subscriptions(&self) -> Vec<String> {
        match &self.inner.shared.lock().mode {
            Mode::Subscribed(subscription) => subscription.names(),
            _ => Vec::new(),
        }
    }

    /// Sends `command` and waits for its reply, bound to `destination`.
    ///
    /// When the connection was configured with a command timeout the call is bounded by it, see
    /// [`Connection::command_timeout`].
    pub async fn command(&self, command: Command, destination: Destination) -> Result<Value> {
        match self.inner.command_timeout {
            Some(deadline) => self.command_timeout(command, destination, deadline).await,
            None => self.roundtrip(command, destination).await,
        }
    }

    async fn roundtrip(&self, command: Command, destination: Destination) -> Result<Value> {
        self.command_async(command, destination).await?.await
    }

    /// Like [`Connection::command`] but gives up after `deadline`.
    ///
    /// A request cannot be withdrawn once written, and its late reply would be handed to the next
    /// request in line. Expiry therefore closes the connection: the caller gets
    /// [`Error::Timeout`] and everything else still pending fails with
    /// [`Error::ConnectionClosed`].
    pub async fn command_timeout(
        &self,
        command: Command,
        destination: Destination,
        deadline: Duration,
    ) -> Result<Value> {
        match timeout(deadline, self.roundtrip(command, destination)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(connection_id = %self.id(), ?deadline, "command timed out, closing connection");
                self.inner.shared.terminate();
                Err(Error::Timeout(deadline))
            }
        }
    }

    /// Writes `command` and returns as soon as it is on the wire. The returned future resolves
    /// when the read loop reaches its reply, which lets callers pipeline requests.
    pub async fn command_async(
        &self,
        command: Command,
        destination: Destination,
    ) -> Result<ReplyFuture> {
        let (completion, reply) = oneshot::channel();

        self.submit(
            command,
            Pending::Reply(PendingRequest {
                destination,
                completion,
            }),
        )
        .await?;

        Ok(ReplyFuture { reply })
    }

    /// Sends a `SUBSCRIBE` or `PSUBSCRIBE` and switches the connection into subscription mode.
    ///
    /// Returns once the server confirmed the first channel. From then on every pushed frame,
    /// confirmations included, is delivered to `sink` until the server reports that no
    /// subscription is left, at which point the sink is dropped. Regular commands are rejected
    /// with [`Error::Subscribed`] in the meantime.
    ///
    /// A full sink blocks the read loop, so use a dedicated connection for subscriptions.
    pub async fn subscribe(&self, command: Command, sink: Sink) -> Result<()> {
        let expect = match subscription::confirmations(&command) {
            Some((PushKind::Subscribe | PushKind::Psubscribe, expect)) => expect,
            _ => return Err(Error::WrongCommand(command.name())),
        };
        let (ack, confirmed) = oneshot::channel();

        self.submit(command, Pending::Subscribe { sink, expect, ack })
            .await?;

        confirmed.await.unwrap_or(Err(Error::ConnectionClosed))
    }

    /// Adds channels or patterns to an active subscription. Their confirmations and messages go to
    /// the sink given to [`Connection::subscribe`].
    pub async fn subscribe_more(&self, command: Command) -> Result<()> {
        match subscription::confirmations(&command) {
            Some((PushKind::Subscribe | PushKind::Psubscribe, expect)) => {
                self.submit(command, Pending::Confirmations(expect)).await
            }
            _ => Err(Error::WrongCommand(command.name())),
        }
    }

    /// Sends an `UNSUBSCRIBE` or `PUNSUBSCRIBE`. The connection leaves subscription mode once the
    /// server confirms that nothing is left, see [`Connection::wait_unsubscribed`].
    pub async fn unsubscribe(&self, command: Command) -> Result<()> {
        match subscription::confirmations(&command) {
            Some((PushKind::Unsubscribe | PushKind::Punsubscribe, expect)) => {
                self.submit(command, Pending::Confirmations(expect)).await
            }
            _ => Err(Error::WrongCommand(command.name())),
        }
    }

    /// Resolves once the connection is back in command mode, or closed.
    pub async fn wait_unsubscribed(&self) {
        let mut subscribed = self.inner.shared.subscribed.subscribe();
        // Only fails if the sender is gone, and with it the connection.
        let _ = subscribed.wait_for(|subscribed| !subscribed).await;
    }

    /// Says `QUIT` when possible, then closes the socket. Pending requests fail with
    /// [`Error::ConnectionClosed`]; later calls fail with [`Error::NotConnected`]. Closing twice
    /// is a no-op.
    ///
    /// Returns [`Error::Timeout`] when the write half could not be shut down in time. The
    /// connection is closed regardless.
    pub async fn close(&self) -> Result<()> {
        let quit = {
            let state = self.inner.shared.lock();
            state.open && matches!(state.mode, Mode::Commands)
        };

        if quit {
            let reply = timeout(
                QUIT_TIMEOUT,
                self.command(Command::new("QUIT"), Destination::Frame),
            )
            .await;
            debug!(connection_id = %self.id(), ?reply, "quit");
        }

        self.inner.shared.terminate();

        let shutdown = async { self.inner.writer.lock().await.close().await };
        match timeout(SHUTDOWN_TIMEOUT, shutdown).await {
            Ok(result) => result?,
            Err(_) => {
                // The socket is released once the stuck write gives up and the last handle is
                // dropped.
                warn!(connection_id = %self.id(), "write half busy, socket left to the pending write");
                return Err(Error::Timeout(SHUTDOWN_TIMEOUT));
            }
        }

        info!(connection_id = %self.id(), "connection closed");
        Ok(())
    }

    /// Writes `command` and queues `pending` for its reply, keeping queue order equal to wire
    /// order.
    ///
    /// The caller's future may be dropped at any await point. Up to the end of `feed_command`
    /// nothing has been buffered nor queued. From then on the command is buffered, and it is
    /// queued before the next await, so a later flush can never put an unqueued command on the
    /// wire.
    async fn submit(&self, command: Command, pending: Pending) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        self.inner.shared.admit(&pending)?;

        debug!(connection_id = %self.id(), %command, "sending command");

        if let Err(err) = writer.feed_command(command).await {
            return Err(self.write_failed(err));
        }

        if let Err(err) = self.inner.shared.enqueue(pending) {
            // Closed, or the subscription ended, while waiting for buffer space. The buffered
            // command has no queue entry left to receive its reply.
            self.inner.shared.terminate();
            return Err(err);
        }

        writer
            .flush()
            .await
            .map_err(|err| self.write_failed(err))
    }

    fn write_failed(&self, err: Error) -> Error {
        // Part of the buffer may have reached the socket, nothing after it can be trusted.
        error!(connection_id = %self.id(), error = %err, "write failed, closing connection");
        self.inner.shared.terminate();
        err
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.shared.id)
            .field("peer", &self.inner.shared.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks that `pending` may be queued in the current state, before anything is written.
    fn admit(&self, pending: &Pending) -> Result<()> {
        admission(&self.lock(), pending).map(|_| ())
    }

    /// Queues a request. Must be called with the write lock held, right after its command was
    /// buffered.
    fn enqueue(&self, pending: Pending) -> Result<()> {
        let mut state = self.lock();

        if admission(&state, &pending)? {
            state.mode = Mode::Subscribing;
            self.subscribed.send_replace(true);
        }
        state.pending.push_back(pending);
        Ok(())
    }

    /// Stops accepting requests and wakes the read loop, which fails whatever is still queued.
    fn terminate(&self) {
        self.lock().open = false;
        self.shutdown.cancel();
    }

    /// Hands `frame` to whoever is owed it. Returns the sink when it has to be forwarded, which
    /// happens outside the lock.
    fn route(&self, frame: Frame) -> Result<Option<(Sink, Frame)>> {
        let mut guard = self.lock();
        let state = &mut *guard;

        if let Mode::Subscribed(subscription) = &mut state.mode {
            let answers_command = matches!(frame, Frame::Error(_))
                || PushKind::of(&frame).is_some_and(PushKind::is_confirmation);

            if answers_command && subscription.awaiting() == 0 {
                if let Some(Pending::Confirmations(expect)) = state.pending.front() {
                    subscription.begin(*expect);
                    state.pending.pop_front();
                }
            }

            subscription.observe(&frame);
            let sink = subscription.sink();

            if subscription.is_finished() && state.pending.is_empty() {
                debug!("no subscription left, back to command mode");
                state.mode = Mode::Commands;
                self.subscribed.send_replace(false);
            }

            return Ok(Some((sink, frame)));
        }

        match state.pending.pop_front() {
            Some(Pending::Reply(request)) => {
                request.complete(frame);
                Ok(None)
            }
            Some(Pending::Subscribe { sink, expect, ack }) => {
                if let Frame::Error(_) = frame {
                    state.mode = Mode::Commands;
                    self.subscribed.send_replace(false);
                    let _ = ack.send(value::bind(frame, Destination::Frame).map(|_| ()));
                    return Ok(None);
                }

                if !PushKind::of(&frame).is_some_and(PushKind::is_confirmation) {
                    // Left queued so the subscriber is the one to receive the error.
                    state
                        .pending
                        .push_front(Pending::Subscribe { sink, expect, ack });
                    return Err(Error::Protocol(format!(
                        "expected a subscribe confirmation, got {}",
                        frame.kind()
                    )));
                }

                let mut subscription = SubscriptionState::new(sink);
                subscription.begin(expect);
                subscription.observe(&frame);
                let sink = subscription.sink();

                state.mode = Mode::Subscribed(subscription);
                let _ = ack.send(Ok(()));

                Ok(Some((sink, frame)))
            }
            Some(Pending::Confirmations(_)) => Err(Error::Protocol(
                "subscription confirmation queued in command mode".to_string(),
            )),
            None => Err(Error::Protocol(format!(
                "unsolicited {} reply",
                frame.kind()
            ))),
        }
    }

    /// Closes the connection for good. The oldest request gets `error`, every other one
    /// [`Error::ConnectionClosed`].
    fn fail_all(&self, error: Error) {
        let pending = {
            let mut state = self.lock();
            state.open = false;
            state.mode = Mode::Commands;
            mem::take(&mut state.pending)
        };
        self.subscribed.send_replace(false);
        self.shutdown.cancel();

        let mut error = Some(error);
        for pending in pending {
            if let Pending::Confirmations(_) = pending {
                continue;
            }
            pending.fail(error.take().unwrap_or(Error::ConnectionClosed));
        }
    }
}

/// Whether `pending` may be queued, and if so whether it switches the connection to subscription
/// mode.
fn admission(state: &State, pending: &Pending) -> Result<bool> {
    if !state.open {
        return Err(Error::NotConnected);
    }

    match (&state.mode, pending) {
        (Mode::Commands, Pending::Reply(_)) => Ok(false),
        (Mode::Subscribed(_), Pending::Confirmations(_)) => Ok(false),
        (Mode::Commands, Pending::Subscribe { .. }) => Ok(true),
        (Mode::Commands | Mode::Subscribing, Pending::Confirmations(_)) => {
            Err(Error::NotSubscribed)
        }
        _ => Err(Error::Subscribed),
    }
}

/// Decodes replies until the stream ends, fails or the connection is shut down, then fails
/// everything still pending.
#[instrument(name = "read_loop", skip(reader, shared), fields(connection_id, peer))]
async fn read_loop(mut reader: TransportReader, shared: Arc<Shared>) {
    tracing::Span::current()
        .record("connection_id", shared.id.to_string())
        .record("peer", shared.peer.as_str());

    let outcome: Result<()> = 'read: loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => break 'read Ok(()),
            frame = reader.read_frame() => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("connection closed by peer");
                break 'read Ok(());
            }
            Err(err) => break 'read Err(err),
        };

        debug!(?frame, "received frame");

        let (sink, frame) = match shared.route(frame) {
            Ok(Some(push)) => push,
            Ok(None) => continue,
            Err(err) => break 'read Err(err),
        };

        tokio::select! {
            _ = shared.shutdown.cancelled() => break 'read Ok(()),
            sent = sink.send(frame) => {
                if sent.is_err() {
                    warn!("subscription receiver dropped, discarding pushed frame");
                }
            }
        }
    };

    let error = match outcome {
        Ok(()) => Error::ConnectionClosed,
        Err(err) => {
            error!(error = %err, "read loop failed, closing connection");
            err
        }
    };

    shared.fail_all(error);
}
