//! The public connection type, tying the marshaller, framer, SASL engine,
//! transport, lifecycle FSM, correlator, and pipeline together.
//!
//! A cooperative I/O task owns the transport exclusively; everything else
//! — correlated replies, pipeline dispatch, reconnection, health checks —
//! runs as separate tasks that only ever touch the wire through
//! message-passing, never by reaching into the I/O task's state directly.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dbus_peer_core::{BasicValue, Endianness, Flags, MessageType, ObjectPath, Value};
use rand::Rng;
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::address::{self, Endpoint};
use crate::config::Config;
use crate::correlator::Correlator;
use crate::error::{Error, ErrorKind, Result};
use crate::lifecycle::LifecycleState;
use crate::message::{Framer, HeaderFields, InboundMessage, MessageBuilder, MessageHeader, OutboundMessage};
use crate::pipeline::Pipeline;
use crate::sasl;
use crate::transport::{self, Transport};

/// Consecutive reconnect failures tolerated before the circuit breaker
/// opens and an extra cool-down (`reconnect_max_delay`) is inserted before
/// attempts resume. Kept as an internal constant rather than a new `Config`
/// knob; see `DESIGN.md`.
const CIRCUIT_BREAKER_THRESHOLD: u32 = 8;

struct Inner {
    config: Config,
    endpoints: Vec<Endpoint>,
    serial: AtomicU32,
    bus_name: StdMutex<Option<String>>,
    state_tx: watch::Sender<LifecycleState>,
    pipeline: Pipeline,
    correlator: Arc<Correlator>,
    outbound_tx: StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    unix_fds_negotiated: AtomicBool,
    /// Set when `on_connection_active` has fired and not yet paired with an
    /// `on_connection_inactive`. `fail()` and `close()` both race to deliver
    /// the inactive transition, so this keeps the pairing exactly 1:1 (spec
    /// §5 ordering guarantee (d)) instead of firing it twice when `close()`
    /// is called on a connection that already failed on its own.
    activated: AtomicBool,
    connect_lock: tokio::sync::Mutex<()>,
    close_lock: tokio::sync::Mutex<()>,
    io_task: StdMutex<Option<JoinHandle<()>>>,
    health_task: StdMutex<Option<JoinHandle<()>>>,
    reconnect_task: StdMutex<Option<JoinHandle<()>>>,
    forwarder_task: StdMutex<Option<JoinHandle<()>>>,
}

/// A client-side D-Bus connection.
///
/// Cheap to clone: every clone shares the same transport, pipeline, and
/// pending-reply table through an inner `Arc`.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Construct a connection to `address` (the D-Bus address grammar). The
    /// connection starts `DISCONNECTED`; call [`Connection::connect`] to
    /// dial it.
    pub fn new(address: &str, config: Config) -> Result<Self> {
        Ok(Self::from_endpoints(address::parse(address)?, config))
    }

    /// Construct a connection to the session bus named by
    /// `DBUS_SESSION_BUS_ADDRESS`.
    pub fn session_bus(config: Config) -> Result<Self> {
        Ok(Self::from_endpoints(address::session_bus()?, config))
    }

    /// Construct a connection to the system bus, falling back to the
    /// well-known Unix socket path if `DBUS_SYSTEM_BUS_ADDRESS` is unset.
    pub fn system_bus(config: Config) -> Result<Self> {
        Ok(Self::from_endpoints(address::system_bus()?, config))
    }

    fn from_endpoints(endpoints: Vec<Endpoint>, config: Config) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Disconnected);
        let (write_tx, write_rx) = mpsc::unbounded_channel::<MessageBuilder>();
        let pipeline = Pipeline::new(config.worker_pool_size, write_tx);

        let inner = Arc::new(Inner {
            config,
            endpoints,
            serial: AtomicU32::new(0),
            bus_name: StdMutex::new(None),
            state_tx,
            pipeline,
            correlator: Correlator::new(),
            outbound_tx: StdMutex::new(None),
            unix_fds_negotiated: AtomicBool::new(false),
            activated: AtomicBool::new(false),
            connect_lock: tokio::sync::Mutex::new(()),
            close_lock: tokio::sync::Mutex::new(()),
            io_task: StdMutex::new(None),
            health_task: StdMutex::new(None),
            reconnect_task: StdMutex::new(None),
            forwarder_task: StdMutex::new(None),
        });

        let connection = Self { inner };
        connection.spawn_pipeline_forwarder(write_rx);
        connection
    }

    fn spawn_pipeline_forwarder(&self, mut write_rx: mpsc::UnboundedReceiver<MessageBuilder>) {
        let connection = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(builder) = write_rx.recv().await {
                let serial = connection.next_serial();
                match builder.build(serial) {
                    Ok(message) => {
                        if let Err(e) = connection.send(message).await {
                            tracing::warn!(error = %e, "pipeline-issued send failed");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "pipeline issued an invalid message"),
                }
            }
        });

        *self.inner.forwarder_task.lock().expect("forwarder lock poisoned") = Some(handle);
    }

    /// The handler chain for this connection.
    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    /// The unique bus name assigned by `Hello`, once `ACTIVE`.
    pub fn assigned_bus_name(&self) -> Option<String> {
        self.inner.bus_name.lock().expect("bus name lock poisoned").clone()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to lifecycle transitions. Dropping the receiver removes
    /// the listener; there is no separate unsubscribe call.
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state_tx.subscribe()
    }

    /// Allocate the next outbound serial, skipping zero on overflow (spec
    /// §4.6).
    pub fn next_serial(&self) -> u32 {
        loop {
            let next = self.inner.serial.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if next != 0 {
                return next;
            }
        }
    }

    /// Dial the transport, authenticate, and complete the `Hello`
    /// handshake. Idempotent: concurrent calls coalesce onto the single
    /// in-flight attempt, and calling it again once `ACTIVE` is a no-op.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;

        match self.state() {
            LifecycleState::Active => Ok(()),
            LifecycleState::Closed | LifecycleState::Closing => Err(ErrorKind::Closed.into()),
            _ => self.run_connect_sequence().await,
        }
    }

    /// Test-only entry point that runs the authenticate/Hello sequence over
    /// an already-connected transport instead of dialing `self.endpoints`,
    /// so the lifecycle can be exercised against an in-memory fake server.
    #[cfg(test)]
    pub(crate) async fn connect_with_transport(&self, transport: Box<dyn Transport>) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;

        match self.state() {
            LifecycleState::Active => Ok(()),
            LifecycleState::Closed | LifecycleState::Closing => Err(ErrorKind::Closed.into()),
            _ => self.run_connect_sequence_with(transport).await,
        }
    }

    async fn run_connect_sequence(&self) -> Result<()> {
        self.set_state(LifecycleState::Connecting);

        let transport = tokio::time::timeout(
            self.inner.config.connect_timeout,
            transport::connect(&self.inner.endpoints),
        )
        .await
        .map_err(|_| {
            Error::from(ErrorKind::Transport(io::Error::new(
                io::ErrorKind::TimedOut,
                "connecting timed out",
            )))
        })??;

        self.run_connect_sequence_with(transport).await
    }

    /// Authenticate and complete `Hello` over an already-dialed transport.
    ///
    /// Split out of [`Self::run_connect_sequence`] so tests can exercise the
    /// SASL/Hello/active sequence against an in-memory fake server instead of
    /// a real socket; production code always reaches this through
    /// `run_connect_sequence`.
    async fn run_connect_sequence_with(&self, mut transport: Box<dyn Transport>) -> Result<()> {
        self.set_state(LifecycleState::Authenticating);

        let mechanisms: Vec<Box<dyn sasl::Mechanism>> = self
            .inner
            .config
            .sasl_mechanisms
            .iter()
            .map(|kind| kind.build())
            .collect();

        let negotiated_fds =
            sasl::authenticate(&mut transport, mechanisms, self.inner.config.allow_unix_fd).await?;
        self.inner.unix_fds_negotiated.store(negotiated_fds, Ordering::Release);

        self.set_state(LifecycleState::AwaitingHello);

        let (read_half, write_half) = split(transport);
        let (write_tx, write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        *self.inner.outbound_tx.lock().expect("outbound lock poisoned") = Some(write_tx);

        let io_task = tokio::spawn(self.clone().run(read_half, write_half, write_rx));
        *self.inner.io_task.lock().expect("io task lock poisoned") = Some(io_task);

        let hello = MessageBuilder::method_call(ObjectPath::ROOT, "Hello")
            .interface("org.freedesktop.DBus")
            .destination("org.freedesktop.DBus")
            .build(self.next_serial())?;

        let reply = self.send_request_inner(hello).await?;

        let name = match reply.body.first() {
            Some(Value::Basic(BasicValue::String(s))) if s.starts_with(':') => s.clone(),
            _ => return Err(ErrorKind::Corrupted("Hello reply did not carry a unique bus name").into()),
        };
        *self.inner.bus_name.lock().expect("bus name lock poisoned") = Some(name);

        self.set_state(LifecycleState::Active);
        self.inner.activated.store(true, Ordering::Release);
        self.inner.pipeline.fire_connection_active();

        if self.inner.config.health_check_enabled {
            self.spawn_health_check();
        }

        Ok(())
    }

    fn set_state(&self, state: LifecycleState) {
        tracing::debug!(%state, "lifecycle transition");
        let _ = self.inner.state_tx.send(state);
    }

    fn ensure_active(&self) -> Result<()> {
        let state = self.state();
        if state.is_active() {
            Ok(())
        } else {
            Err(ErrorKind::NotActive(state).into())
        }
    }

    /// Write `message` without expecting or correlating a reply.
    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        self.ensure_active()?;
        self.write_message(&message).await
    }

    /// Write `message` and return a future resolving to its correlated
    /// reply. A `NO_REPLY_EXPECTED` call resolves immediately on a
    /// successful write, with no pending entry created.
    pub async fn send_request(&self, message: OutboundMessage) -> Result<InboundMessage> {
        self.ensure_active()?;
        self.send_request_inner(message).await
    }

    async fn send_request_inner(&self, message: OutboundMessage) -> Result<InboundMessage> {
        let serial = message.header.serial;

        if message.header.flags.contains(Flags::NO_REPLY_EXPECTED) {
            self.write_message(&message).await?;
            return Ok(synthetic_ack(serial));
        }

        let rx = self
            .inner
            .correlator
            .register_direct(serial, self.inner.config.method_call_timeout);

        if let Err(e) = self.write_message(&message).await {
            self.inner.correlator.cancel(serial);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ErrorKind::Closed.into()),
        }
    }

    /// Write `message`, routing its eventual reply to the pipeline as an
    /// inbound message rather than completing a future.
    pub async fn send_and_route(&self, message: OutboundMessage) -> Result<()> {
        self.ensure_active()?;
        let serial = message.header.serial;

        self.inner.correlator.register_routed(serial);

        if let Err(e) = self.write_message(&message).await {
            self.inner.correlator.cancel(serial);
            return Err(e);
        }

        Ok(())
    }

    async fn write_message(&self, message: &OutboundMessage) -> Result<()> {
        if message.header.fields.unix_fds.is_some() && !self.inner.unix_fds_negotiated.load(Ordering::Acquire) {
            return Err(ErrorKind::UnixFdsUnsupported.into());
        }

        self.inner.pipeline.fire_outbound(message.clone());

        let bytes = crate::message::encode_frame(message)?;

        let tx = self.inner.outbound_tx.lock().expect("outbound lock poisoned").clone();
        match tx {
            Some(tx) => tx.send(bytes).map_err(|_| Error::from(ErrorKind::Closed)),
            None => Err(ErrorKind::Closed.into()),
        }
    }

    async fn dispatch_inbound(&self, message: InboundMessage) {
        match message.header.message_type {
            MessageType::MethodReturn | MessageType::Error => {
                self.inner.correlator.complete(message, &self.inner.pipeline);
            }
            MessageType::MethodCall | MessageType::Signal => {
                self.inner.pipeline.fire_inbound(message);
            }
        }
    }

    async fn run(
        self,
        mut read_half: ReadHalf<Box<dyn Transport>>,
        mut write_half: WriteHalf<Box<dyn Transport>>,
        mut write_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let mut framer = Framer::new();
        let mut buf = vec![0u8; 16 * 1024];

        loop {
            tokio::select! {
                biased;

                maybe_bytes = write_rx.recv() => {
                    let Some(bytes) = maybe_bytes else {
                        // Every sender dropped: the connection is closing.
                        return;
                    };
                    let write = write_half.write_all(&bytes);
                    let result = match self.inner.config.write_timeout {
                        Some(timeout) => match tokio::time::timeout(timeout, write).await {
                            Ok(result) => result,
                            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
                        },
                        None => write.await,
                    };
                    if let Err(e) = result {
                        self.fail(e.into()).await;
                        return;
                    }
                }

                result = read_with_deadline(&mut read_half, &mut buf, self.inner.config.read_timeout) => {
                    match result {
                        Ok(0) => {
                            let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the connection");
                            self.fail(ErrorKind::Transport(eof).into()).await;
                            return;
                        }
                        Ok(n) => {
                            framer.push(&buf[..n]);
                            loop {
                                match framer.next_message() {
                                    Ok(Some(message)) => self.dispatch_inbound(message).await,
                                    Ok(None) => break,
                                    Err(e) => {
                                        self.fail(e).await;
                                        return;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            self.fail(e.into()).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn fail(&self, error: Error) {
        tracing::warn!(error = %error, "connection lost");

        *self.inner.outbound_tx.lock().expect("outbound lock poisoned") = None;
        self.inner.correlator.fail_all();
        self.inner.pipeline.fire_exception(error);
        if self.inner.activated.swap(false, Ordering::AcqRel) {
            self.inner.pipeline.fire_connection_inactive();
        }

        if matches!(self.state(), LifecycleState::Closing | LifecycleState::Closed) {
            return;
        }

        if self.inner.config.auto_reconnect_enabled {
            self.set_state(LifecycleState::Degraded);
            self.spawn_reconnect_loop();
        } else {
            self.set_state(LifecycleState::Disconnected);
        }
    }

    fn spawn_reconnect_loop(&self) {
        let connection = self.clone();
        let handle = tokio::spawn(connection.reconnect_loop());
        *self.inner.reconnect_task.lock().expect("reconnect lock poisoned") = Some(handle);
    }

    async fn reconnect_loop(self) {
        let mut attempt: u32 = 0;

        loop {
            if self.state() != LifecycleState::Degraded {
                return;
            }

            if attempt > 0 && attempt % CIRCUIT_BREAKER_THRESHOLD == 0 {
                tracing::warn!(attempt, "circuit breaker open, cooling down before further reconnect attempts");
                tokio::time::sleep(self.inner.config.reconnect_max_delay).await;
            }

            tokio::time::sleep(backoff_delay(&self.inner.config, attempt)).await;

            if self.state() != LifecycleState::Degraded {
                return;
            }

            match self.run_connect_sequence().await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "reconnect attempt failed");
                    attempt += 1;
                    self.set_state(LifecycleState::Degraded);
                }
            }
        }
    }

    fn spawn_health_check(&self) {
        let connection = self.clone();
        let handle = tokio::spawn(connection.health_check_loop());
        *self.inner.health_task.lock().expect("health lock poisoned") = Some(handle);
    }

    async fn health_check_loop(self) {
        let mut interval = tokio::time::interval(self.inner.config.health_check_interval);
        let mut consecutive_failures = 0u32;

        loop {
            interval.tick().await;

            if self.state() != LifecycleState::Active {
                return;
            }

            let ping = MessageBuilder::method_call(ObjectPath::ROOT, "Ping")
                .interface("org.freedesktop.DBus.Peer")
                .destination("org.freedesktop.DBus")
                .build(self.next_serial());

            let ping = match ping {
                Ok(message) => message,
                Err(_) => continue,
            };

            match self.send_request_inner(ping).await {
                Ok(_) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures += 1;
                    tracing::warn!(error = %e, consecutive_failures, "health check ping failed");

                    if consecutive_failures >= self.inner.config.max_consecutive_health_failures {
                        let timeout = io::Error::new(io::ErrorKind::TimedOut, "health check exceeded its failure budget");
                        self.fail(ErrorKind::Transport(timeout).into()).await;
                        return;
                    }
                }
            }
        }
    }

    /// Gracefully shut down: fail every pending call with `Closed`, stop
    /// background tasks, and close the transport. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.inner.close_lock.lock().await;

        if self.state() == LifecycleState::Closed {
            return Ok(());
        }

        self.set_state(LifecycleState::Closing);
        self.inner.correlator.fail_all();

        if let Some(handle) = self.inner.reconnect_task.lock().expect("reconnect lock poisoned").take() {
            handle.abort();
        }
        if let Some(handle) = self.inner.health_task.lock().expect("health lock poisoned").take() {
            handle.abort();
        }

        *self.inner.outbound_tx.lock().expect("outbound lock poisoned") = None;

        if let Some(handle) = self.inner.io_task.lock().expect("io task lock poisoned").take() {
            handle.abort();
            let _ = tokio::time::timeout(self.inner.config.close_timeout, handle).await;
        }

        if self.inner.activated.swap(false, Ordering::AcqRel) {
            self.inner.pipeline.fire_connection_inactive();
        }
        self.set_state(LifecycleState::Closed);

        Ok(())
    }
}

/// Reads into `buf`, applying `deadline` as a per-read timeout when set.
/// A timed-out read surfaces as an ordinary `io::Error` so the caller's
/// existing transport-failure handling applies unchanged.
async fn read_with_deadline(
    read_half: &mut ReadHalf<Box<dyn Transport>>,
    buf: &mut [u8],
    deadline: Option<Duration>,
) -> io::Result<usize> {
    match deadline {
        Some(timeout) => match tokio::time::timeout(timeout, read_half.read(buf)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
        },
        None => read_half.read(buf).await,
    }
}

fn synthetic_ack(serial: u32) -> InboundMessage {
    InboundMessage {
        header: MessageHeader {
            endianness: Endianness::NATIVE,
            message_type: MessageType::MethodReturn,
            flags: Flags::NONE,
            serial,
            body_length: 0,
            fields: HeaderFields {
                reply_serial: Some(serial),
                ..HeaderFields::default()
            },
        },
        body: Vec::new(),
    }
}

fn backoff_delay(config: &Config, attempt: u32) -> Duration {
    let base = config.reconnect_initial_delay.as_secs_f64()
        * config.reconnect_backoff_multiplier.powi(attempt as i32);
    let capped = base.min(config.reconnect_max_delay.as_secs_f64());

    let jitter = if config.reconnect_jitter > 0.0 {
        rand::thread_rng().gen_range(-config.reconnect_jitter..=config.reconnect_jitter)
    } else {
        0.0
    };

    Duration::from_secs_f64((capped * (1.0 + jitter)).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        let mut config = Config::new();
        config
            .reconnect_initial_delay(Duration::from_millis(100))
            .reconnect_backoff_multiplier(2.0)
            .reconnect_max_delay(Duration::from_secs(1))
            .reconnect_jitter(0.0);

        assert_eq!(backoff_delay(&config, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 10), Duration::from_secs(1));
    }

    #[test]
    fn next_serial_skips_zero_on_overflow() {
        let connection = Connection::new("unix:path=/does/not/matter", Config::new()).unwrap();
        connection.inner.serial.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(connection.next_serial(), 1);
    }

    #[tokio::test]
    async fn send_request_before_connect_fails_with_not_active() {
        let connection = Connection::new("unix:path=/does/not/matter", Config::new()).unwrap();
        let message = MessageBuilder::method_call(ObjectPath::ROOT, "Ping").build(1).unwrap();

        let error = connection.send(message).await.unwrap_err();
        assert!(matches!(error.kind(), ErrorKind::NotActive(LifecycleState::Disconnected)));
    }

    #[tokio::test]
    async fn closing_twice_is_a_no_op() {
        let connection = Connection::new("unix:path=/does/not/matter", Config::new()).unwrap();
        connection.close().await.unwrap();
        connection.close().await.unwrap();
        assert_eq!(connection.state(), LifecycleState::Closed);
    }
}

/// End-to-end scenarios driving a real [`Connection`] against an in-memory
/// fake bus over a `tokio::io::duplex` pair, rather than exercising
/// individual components in isolation the way the rest of the test suite
/// does.
#[cfg(test)]
mod e2e {
    use super::*;
    use crate::pipeline::{Handler, PipelineContext};
    use dbus_peer_core::SignatureBuf;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

    const DUPLEX_CAPACITY: usize = 64 * 1024;

    /// Wraps one end of an in-memory duplex stream as a [`Transport`], with
    /// fixed credentials standing in for `SO_PEERCRED` so `EXTERNAL`
    /// authentication has a UID to offer.
    struct FakeTransport(DuplexStream);

    impl AsyncRead for FakeTransport {
        fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for FakeTransport {
        fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_shutdown(cx)
        }
    }

    impl Transport for FakeTransport {
        fn credentials(&self) -> crate::transport::Credentials {
            crate::transport::Credentials { unix_uid: Some(1000) }
        }
    }

    /// The other end of the duplex, played by hand as a minimal bus: enough
    /// SASL and framing to get a real client through `connect` and exchange
    /// messages with it.
    struct FakeServer {
        io: DuplexStream,
        framer: Framer,
    }

    impl FakeServer {
        async fn handshake(&mut self) {
            let mut nul = [0u8; 1];
            self.io.read_exact(&mut nul).await.expect("client should send the leading NUL");
            assert_eq!(nul[0], 0);

            let auth_line = self.read_line().await;
            assert!(auth_line.starts_with("AUTH EXTERNAL"), "unexpected line: {auth_line}");
            self.io
                .write_all(b"OK 0123456789abcdef0123456789abcdef\r\n")
                .await
                .unwrap();

            let begin_line = self.read_line().await;
            assert_eq!(begin_line, "BEGIN");
        }

        async fn read_line(&mut self) -> String {
            let mut bytes = Vec::new();
            loop {
                let mut b = [0u8; 1];
                self.io.read_exact(&mut b).await.expect("client closed mid-handshake");
                bytes.push(b[0]);
                if bytes.ends_with(b"\r\n") {
                    bytes.truncate(bytes.len() - 2);
                    return String::from_utf8(bytes).expect("SASL lines are ASCII");
                }
            }
        }

        async fn recv(&mut self) -> InboundMessage {
            loop {
                if let Some(message) = self.framer.next_message().expect("client sent a malformed frame") {
                    return message;
                }
                let mut chunk = [0u8; 4096];
                let n = self.io.read(&mut chunk).await.expect("read from client failed");
                assert!(n > 0, "client closed the connection unexpectedly");
                self.framer.push(&chunk[..n]);
            }
        }

        async fn send(&mut self, message: OutboundMessage) {
            let bytes = crate::message::encode_frame(&message).unwrap();
            self.io.write_all(&bytes).await.unwrap();
        }
    }

    /// Builds a fresh `Connection` plus one end of a duplex pair to drive it
    /// through, and the fake server holding the other end.
    fn paired() -> (Connection, FakeTransport, FakeServer) {
        paired_with_config(Config::new())
    }

    /// Same as `paired`, but with a caller-supplied `Config` so timeout and
    /// backoff tests can shorten the defaults.
    fn paired_with_config(config: Config) -> (Connection, FakeTransport, FakeServer) {
        let (client_io, server_io) = tokio::io::duplex(DUPLEX_CAPACITY);
        let connection = Connection::new("unix:path=/unused", config).unwrap();
        let server = FakeServer {
            io: server_io,
            framer: Framer::new(),
        };
        (connection, FakeTransport(client_io), server)
    }

    /// Replies to the client's mandatory `Hello` call with `bus_name`,
    /// itself keyed off whatever serial the client actually sent.
    async fn reply_to_hello(server: &mut FakeServer, bus_name: &str) {
        let hello = server.recv().await;
        assert_eq!(hello.header.fields.member.as_deref(), Some("Hello"));
        let reply = MessageBuilder::method_return(hello.header.serial)
            .body(vec![Value::Basic(BasicValue::String(bus_name.into()))])
            .build(1)
            .unwrap();
        server.send(reply).await;
    }

    #[tokio::test]
    async fn hello_handshake_assigns_bus_name_and_goes_active() {
        let (connection, transport, mut server) = paired();

        let server_task = tokio::spawn(async move {
            server.handshake().await;
            reply_to_hello(&mut server, ":1.42").await;
            server
        });

        connection.connect_with_transport(Box::new(transport)).await.unwrap();

        assert_eq!(connection.state(), LifecycleState::Active);
        assert_eq!(connection.assigned_bus_name().as_deref(), Some(":1.42"));

        server_task.await.unwrap();
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn list_names_resolves_with_the_replied_body() {
        let (connection, transport, mut server) = paired();

        let server_task = tokio::spawn(async move {
            server.handshake().await;
            reply_to_hello(&mut server, ":1.42").await;

            let list_names = server.recv().await;
            assert_eq!(list_names.header.fields.member.as_deref(), Some("ListNames"));

            let names = Value::Array(
                SignatureBuf::parse("s").unwrap(),
                vec![
                    Value::Basic(BasicValue::String(":1.0".into())),
                    Value::Basic(BasicValue::String("org.freedesktop.DBus".into())),
                    Value::Basic(BasicValue::String(":1.42".into())),
                ],
            );
            let reply = MessageBuilder::method_return(list_names.header.serial)
                .body(vec![names])
                .build(2)
                .unwrap();
            server.send(reply).await;
            server
        });

        connection.connect_with_transport(Box::new(transport)).await.unwrap();

        let call = MessageBuilder::method_call(ObjectPath::ROOT, "ListNames")
            .interface("org.freedesktop.DBus")
            .destination("org.freedesktop.DBus")
            .build(connection.next_serial())
            .unwrap();

        let reply = connection.send_request(call).await.unwrap();
        let Value::Array(_, names) = &reply.body[0] else {
            panic!("expected an array body, got {:?}", reply.body);
        };
        let names: Vec<&str> = names
            .iter()
            .map(|v| match v {
                Value::Basic(BasicValue::String(s)) => s.as_str(),
                other => panic!("expected a string element, got {other:?}"),
            })
            .collect();
        assert_eq!(names, [":1.0", "org.freedesktop.DBus", ":1.42"]);

        server_task.await.unwrap();
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn an_error_reply_surfaces_as_bus_error() {
        let (connection, transport, mut server) = paired();

        let server_task = tokio::spawn(async move {
            server.handshake().await;
            reply_to_hello(&mut server, ":1.42").await;

            let call = server.recv().await;
            let reply = MessageBuilder::error(call.header.serial, "org.freedesktop.DBus.Error.ServiceUnknown")
                .body(vec![Value::Basic(BasicValue::String(
                    "The name is not owned".into(),
                ))])
                .build(2)
                .unwrap();
            server.send(reply).await;
            server
        });

        connection.connect_with_transport(Box::new(transport)).await.unwrap();

        let call = MessageBuilder::method_call(ObjectPath::ROOT, "GetConnectionUnixUser")
            .interface("org.freedesktop.DBus")
            .destination("org.freedesktop.DBus")
            .build(connection.next_serial())
            .unwrap();

        let error = connection.send_request(call).await.unwrap_err();
        match error.kind() {
            ErrorKind::BusError { name, message, .. } => {
                assert_eq!(name, "org.freedesktop.DBus.Error.ServiceUnknown");
                assert_eq!(message, "The name is not owned");
            }
            other => panic!("expected BusError, got {other:?}"),
        }

        server_task.await.unwrap();
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn a_late_reply_past_the_method_call_timeout_is_silently_discarded() {
        let mut config = Config::new();
        config.method_call_timeout(Duration::from_millis(100));
        let (connection, transport, mut server) = paired_with_config(config);

        let server_task = tokio::spawn(async move {
            server.handshake().await;
            reply_to_hello(&mut server, ":1.42").await;

            let call = server.recv().await;

            // Reply well after the client's 100ms method-call timeout has
            // already fired and failed the caller's future.
            tokio::time::sleep(Duration::from_millis(200)).await;

            let reply = MessageBuilder::method_return(call.header.serial)
                .body(vec![Value::Basic(BasicValue::String("too late".into()))])
                .build(2)
                .unwrap();
            server.send(reply).await;
            server
        });

        connection.connect_with_transport(Box::new(transport)).await.unwrap();

        let call = MessageBuilder::method_call(ObjectPath::ROOT, "GetId")
            .interface("org.freedesktop.DBus")
            .destination("org.freedesktop.DBus")
            .build(connection.next_serial())
            .unwrap();

        let error = connection.send_request(call).await.unwrap_err();
        assert!(matches!(error.kind(), ErrorKind::Timeout { .. }));

        // The connection itself is unaffected by a call timing out; it
        // stays ACTIVE and keeps serving other traffic.
        assert_eq!(connection.state(), LifecycleState::Active);

        // Give the late reply time to arrive and be discarded by the
        // correlator, which by now holds no entry for its reply_serial.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(connection.state(), LifecycleState::Active);

        server_task.await.unwrap();
        connection.close().await.unwrap();
    }

    struct CapturingHandler {
        messages: Arc<StdMutex<Vec<InboundMessage>>>,
    }

    impl Handler for CapturingHandler {
        fn on_inbound_message(&self, ctx: &PipelineContext, message: &InboundMessage) {
            self.messages.lock().expect("capture lock poisoned").push(message.clone());
            ctx.propagate();
        }
    }

    #[tokio::test]
    async fn an_unsolicited_signal_reaches_the_pipeline() {
        let (connection, transport, mut server) = paired();

        let captured = Arc::new(StdMutex::new(Vec::new()));
        connection.pipeline().add_handler(
            "capture",
            Arc::new(CapturingHandler {
                messages: captured.clone(),
            }),
        );

        let server_task = tokio::spawn(async move {
            server.handshake().await;
            reply_to_hello(&mut server, ":1.42").await;

            let signal = MessageBuilder::signal(
                ObjectPath::new("/org/freedesktop/DBus").unwrap(),
                "org.freedesktop.DBus",
                "NameOwnerChanged",
            )
            .body(vec![
                Value::Basic(BasicValue::String("com.example.Widget".into())),
                Value::Basic(BasicValue::String(String::new())),
                Value::Basic(BasicValue::String(":1.99".into())),
            ])
            .build(2)
            .unwrap();
            server.send(signal).await;
            server
        });

        connection.connect_with_transport(Box::new(transport)).await.unwrap();

        // Give the pipeline worker a moment to drain the event.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let messages = captured.lock().expect("capture lock poisoned");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].header.fields.member.as_deref(), Some("NameOwnerChanged"));
        assert_eq!(
            messages[0].body,
            vec![
                Value::Basic(BasicValue::String("com.example.Widget".into())),
                Value::Basic(BasicValue::String(String::new())),
                Value::Basic(BasicValue::String(":1.99".into())),
            ]
        );
        drop(messages);

        server_task.await.unwrap();
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn closing_under_load_fails_every_pending_call() {
        let (connection, transport, mut server) = paired();

        let server_task = tokio::spawn(async move {
            server.handshake().await;
            reply_to_hello(&mut server, ":1.42").await;

            // Never reply to anything past Hello; just keep draining so the
            // writes don't back up, until the client closes the pipe.
            loop {
                let mut chunk = [0u8; 4096];
                match server.io.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        connection.connect_with_transport(Box::new(transport)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let connection = connection.clone();
            handles.push(tokio::spawn(async move {
                let call = MessageBuilder::method_call(ObjectPath::ROOT, "Ping")
                    .interface("org.freedesktop.DBus.Peer")
                    .destination("org.freedesktop.DBus")
                    .build(connection.next_serial())
                    .unwrap();
                connection.send_request(call).await
            }));
        }

        // Let every call register with the correlator before closing.
        tokio::time::sleep(Duration::from_millis(20)).await;
        connection.close().await.unwrap();

        for handle in handles {
            let result = handle.await.unwrap();
            assert!(matches!(result.unwrap_err().kind(), ErrorKind::Closed));
        }

        assert_eq!(connection.state(), LifecycleState::Closed);
        let _ = server_task.await;
    }
}
