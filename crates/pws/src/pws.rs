//! The persistent-WebSocket transport core.
//!
//! A [`PersistentWebSocket`] delivers binary messages reliably, in order,
//! exactly once, across transient disconnections of the underlying socket.
//! Outbound chunks are journaled until acknowledged; the receiver tracks the
//! next expected index, acknowledges progress, and requests retransmission
//! when it detects a gap or reconnects.
//!
//! # Roles
//! - Client: [`PersistentWebSocket::connect`] owns a reconnect loop.
//! - Server: [`PersistentWebSocket::connected`] adopts an accepted socket.
//!
//! Both feed the same session loop.  One instance serves one logical
//! conversation; indices never reset, so a fresh conversation needs a fresh
//! instance.
//!
//! # Task model
//! All protocol state is mutated behind one mutex, and the session loop is
//! the only task that drives timers and inbound chunks; `send`/`ping` from
//! other tasks serialize through the same mutex.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use rand::Rng as _;
use tokio::sync::{Mutex, Notify, broadcast, watch};
use tokio::time::{Duration, Instant, sleep, sleep_until};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, trace, warn};

use crate::connect::{self, ClientStream};
use crate::error::{ABANDON_MSG, PwsError, WsError};
use crate::jet::{JetCommand, JetPipe};
use crate::journal::Journal;
use crate::timekeeper::{Backoff, BackoffTimer, OneShot, Periodic};
use crate::util::printable_hex;
use crate::wire;

/// Delay between the first unacked inbound chunk and the ack that covers it.
const ACK_TIMEOUT: Duration = Duration::from_secs(1);
/// Unacked inbound chunks that trigger an immediate ack.
const ACK_EVERY: u64 = 16;
/// Journal retransmission backoff bounds.
const JOURNAL_RETRANSMIT_INITIAL: Duration = Duration::from_secs(2);
const JOURNAL_RETRANSMIT_CAP: Duration = Duration::from_secs(30);
/// Minimum spacing of repeated resend requests for the same index.
const RESEND_DEBOUNCE: Duration = Duration::from_millis(500);
/// Sender backoff bounds while the journal is full.
const SEND_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const SEND_BACKOFF_CAP: Duration = Duration::from_secs(30);

const CHANNEL_CAPACITY: usize = 256;

/// What the transport layer must provide: an ordered, message-oriented,
/// bidirectional socket.  Client sockets, server-accepted sockets, and
/// in-process test transports all qualify.
pub trait Transport:
    Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send + 'static
{
}

impl<T> Transport for T where
    T: Stream<Item = Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Unpin
        + Send
        + 'static
{
}

/// Client-side instance over a real WebSocket.
pub type ClientPws = PersistentWebSocket<ClientStream>;

// ---------------------------------------------------------------------------
// Instance state
// ---------------------------------------------------------------------------

struct State {
    /// Next expected inbound index.
    in_index: u64,
    /// Largest inbound index already acknowledged to the peer.
    in_last_ack: u64,
    /// Debounce bookkeeping for outbound resend requests.
    in_last_resend: u64,
    in_last_resend_time: Option<Instant>,
    journal: Journal,
    ack_timer: OneShot,
    journal_timer: BackoffTimer,
    keepalive: Option<Periodic>,
    /// Non-reentrance guard for the inbound processor.
    ipi: bool,
    jet_pipe: Option<JetPipe>,
}

impl State {
    fn new() -> Self {
        Self {
            in_index: 0,
            in_last_ack: 0,
            in_last_resend: 0,
            in_last_resend_time: None,
            journal: Journal::new(),
            ack_timer: OneShot::new(),
            journal_timer: BackoffTimer::new(JOURNAL_RETRANSMIT_INITIAL, JOURNAL_RETRANSMIT_CAP),
            keepalive: None,
            ipi: false,
            jet_pipe: None,
        }
    }
}

pub(crate) struct Shared<T: Transport> {
    log_id: String,
    state: Mutex<State>,
    sink: Mutex<Option<SplitSink<T, Message>>>,
    /// Single-flights `connect`/`connected`; a second caller waits.
    connect_lock: Mutex<()>,
    /// Dropped (set to `None`) on fatal errors so waiting consumers abort.
    incoming_tx: StdMutex<Option<broadcast::Sender<Bytes>>>,
    jet_tx: broadcast::Sender<Bytes>,
    error_tx: broadcast::Sender<String>,
    online: AtomicBool,
    connects: AtomicU64,
    allow_port_forwarding: AtomicBool,
    /// Per-event probability (per mille) of dropping the socket on purpose.
    chaos: AtomicU32,
    abandoned: watch::Sender<bool>,
    keepalive: StdMutex<Option<Duration>>,
    /// Wakes the session loop when timer deadlines change under its feet.
    timer_kick: Notify,
}

/// Reliable, ordered, resumable message transport over a WebSocket.
///
/// Cheap to clone; clones share one instance.
pub struct PersistentWebSocket<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for PersistentWebSocket<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> PersistentWebSocket<T> {
    /// Create an instance for one logical conversation.  `log_id` tags every
    /// log line this instance emits.
    pub fn new(log_id: impl Into<String>) -> Self {
        let (incoming_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (jet_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (error_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (abandoned, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                log_id: log_id.into(),
                state: Mutex::new(State::new()),
                sink: Mutex::new(None),
                connect_lock: Mutex::new(()),
                incoming_tx: StdMutex::new(Some(incoming_tx)),
                jet_tx,
                error_tx,
                online: AtomicBool::new(false),
                connects: AtomicU64::new(0),
                allow_port_forwarding: AtomicBool::new(false),
                chaos: AtomicU32::new(0),
                abandoned,
                keepalive: StdMutex::new(None),
                timer_kick: Notify::new(),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<Shared<T>>) -> Self {
        Self { shared }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Adopt an already-established socket (server side, or tests), run the
    /// session until the socket closes, then go offline.
    ///
    /// Returns `Ok` on a clean socket close, `Err` on failure; only fatal
    /// errors end the conversation.
    pub async fn connected(&self, ws: T) -> Result<(), PwsError> {
        let _single = self.shared.connect_lock.lock().await;
        let mut stream = self.go_online(ws).await?;
        let result = self.listen(&mut stream).await;
        self.go_offline().await;
        if let Err(e) = &result {
            if e.is_fatal() {
                self.seal(e).await;
            }
        }
        result
    }

    /// Stop maintaining the connection: forces offline and makes any running
    /// connect loop exit with a fatal "abandoning connection".
    pub async fn abandon_connection(&self) {
        info!(log_id = %self.shared.log_id, "abandoning connection");
        self.shared.abandoned.send_replace(true);
        self.go_offline().await;
    }

    /// Whether a live socket is currently attached.
    pub fn is_online(&self) -> bool {
        self.shared.online.load(Ordering::SeqCst)
    }

    pub fn is_offline(&self) -> bool {
        !self.is_online()
    }

    /// Count of successful connections over the instance lifetime.
    pub fn connects(&self) -> u64 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Opt in to `forward_to` jet commands.  Default: deny.
    pub fn allow_port_forwarding(&self, allow: bool) {
        self.shared
            .allow_port_forwarding
            .store(allow, Ordering::SeqCst);
    }

    /// Fault injection: per-event probability (0–1000 per mille) of dropping
    /// the socket.  Used by the lossy-reconnect tests.
    pub fn set_chaos(&self, per_mille: u32) {
        self.shared
            .chaos
            .store(per_mille.min(1000), Ordering::Relaxed);
    }

    /// Send a protocol-level ping every `interval` while online.  Applies
    /// from the next connection.  Default: off.
    pub fn keepalive(&self, interval: Option<Duration>) {
        *self.shared.keepalive.lock().expect("keepalive lock") = interval;
    }

    // -----------------------------------------------------------------------
    // Send API
    // -----------------------------------------------------------------------

    /// Queue a message for reliable delivery on the RPC channel and transmit
    /// it if online.
    ///
    /// Blocks (with growing sleeps) while the journal is full.  Never fails:
    /// a dead socket just means the chunk waits for retransmission.  Message
    /// size is bounded only by the underlying WebSocket frame limit.
    pub async fn send(&self, message: impl Into<Bytes>) {
        self.send_channel(message.into(), false).await;
    }

    /// Like [`PersistentWebSocket::send`], on the jet channel.
    pub async fn send_jet(&self, message: impl Into<Bytes>) {
        self.send_channel(message.into(), true).await;
    }

    /// Send a protocol ping; the peer echoes the payload in a pong.
    pub async fn ping(&self, payload: impl Into<Bytes>) {
        let payload = payload.into();
        self.transmit(signal_frame(wire::SIG_PING, &payload)).await;
    }

    // -----------------------------------------------------------------------
    // Output streams
    // -----------------------------------------------------------------------

    /// Complete inbound messages, in order.  Ends when the conversation dies
    /// fatally.  Consumers must keep draining; a lagging consumer loses
    /// messages.
    pub fn incoming(&self) -> impl Stream<Item = Bytes> + Send + 'static {
        let rx = match self
            .shared
            .incoming_tx
            .lock()
            .expect("incoming lock")
            .as_ref()
        {
            Some(tx) => tx.subscribe(),
            // sealed: a fresh channel whose sender is already gone
            None => broadcast::channel(1).1,
        };
        drain_lag(rx, "incoming")
    }

    /// Inbound jet-channel bytes.
    pub fn jet_incoming(&self) -> impl Stream<Item = Bytes> + Send + 'static {
        drain_lag(self.shared.jet_tx.subscribe(), "jet")
    }

    /// Human-readable connection status messages.
    pub fn errors(&self) -> impl Stream<Item = String> + Send + 'static {
        drain_lag(self.shared.error_tx.subscribe(), "errors")
    }

    pub(crate) fn publish_error(&self, message: String) {
        let _ = self.shared.error_tx.send(message);
    }

    // -----------------------------------------------------------------------
    // Session internals
    // -----------------------------------------------------------------------

    async fn go_online(&self, ws: T) -> Result<SplitStream<T>, PwsError> {
        if self.shared.online.swap(true, Ordering::SeqCst) {
            return Err(PwsError::Fatal(
                "went online while already online".to_owned(),
            ));
        }
        let (sink, stream) = ws.split();
        *self.shared.sink.lock().await = Some(sink);
        {
            let mut st = self.shared.state.lock().await;
            st.in_last_resend_time = None;
            if st.in_index > st.in_last_ack {
                st.ack_timer.arm(ACK_TIMEOUT);
            }
            if st.journal.is_empty() {
                st.journal_timer.reset();
            } else {
                st.journal_timer.restart();
            }
            st.keepalive = self
                .shared
                .keepalive
                .lock()
                .expect("keepalive lock")
                .map(Periodic::started);
        }
        let connects = self.shared.connects.fetch_add(1, Ordering::SeqCst) + 1;
        info!(log_id = %self.shared.log_id, connects, "online");
        Ok(stream)
    }

    async fn go_offline(&self) {
        self.shared.online.store(false, Ordering::SeqCst);
        self.drop_socket().await;
        let mut st = self.shared.state.lock().await;
        st.ack_timer.cancel();
        st.journal_timer.cancel();
        st.keepalive = None;
        st.ipi = false;
        debug!(log_id = %self.shared.log_id, "offline");
    }

    /// Close and discard the sink half.  Safe to call repeatedly.
    async fn drop_socket(&self) {
        if let Some(mut sink) = self.shared.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
    }

    /// Publish a fatal error on both output streams and release the jet pipe.
    /// The inbound stream is closed so a waiting RPC call aborts.
    async fn seal(&self, err: &PwsError) {
        error!(log_id = %self.shared.log_id, error = %err, "conversation over");
        let _ = self.shared.error_tx.send(err.to_string());
        self.shared
            .incoming_tx
            .lock()
            .expect("incoming lock")
            .take();
        let mut st = self.shared.state.lock().await;
        if let Some(pipe) = st.jet_pipe.take() {
            pipe.disconnect();
        }
    }

    /// Session loop: one task reading chunks and driving the timers.
    async fn listen(&self, stream: &mut SplitStream<T>) -> Result<(), PwsError> {
        {
            // chunks may have been lost across a reconnect; ask the peer to
            // resend everything we have not seen yet
            let mut st = self.shared.state.lock().await;
            st.in_last_resend_time = None;
            self.send_resend(&mut st).await;
        }
        let mut abandoned = self.shared.abandoned.subscribe();
        if *abandoned.borrow_and_update() {
            return Err(PwsError::Fatal(ABANDON_MSG.to_owned()));
        }
        loop {
            let (ack_deadline, journal_deadline, keepalive_deadline) = {
                let st = self.shared.state.lock().await;
                (
                    st.ack_timer.deadline(),
                    st.journal_timer.deadline(),
                    st.keepalive.as_ref().and_then(Periodic::deadline),
                )
            };
            let now = Instant::now();
            tokio::select! {
                biased;
                _ = abandoned.changed() => {
                    if *abandoned.borrow_and_update() {
                        return Err(PwsError::Fatal(ABANDON_MSG.to_owned()));
                    }
                }
                _ = self.shared.timer_kick.notified() => {}
                frame = stream.next() => match frame {
                    None => return Ok(()),
                    Some(Err(e)) => {
                        return Err(PwsError::Transient(format!("connection failed: {e}")));
                    }
                    Some(Ok(Message::Binary(chunk))) => {
                        if self.chaos_strike().await {
                            return Err(PwsError::Transient(
                                "chaos fault dropped the connection".to_owned(),
                            ));
                        }
                        if let Some(message) = self.process_inbound(chunk).await? {
                            self.emit_incoming(message);
                        }
                    }
                    Some(Ok(Message::Text(_))) => {
                        return Err(PwsError::Protocol(
                            "text frame on a binary transport".to_owned(),
                        ));
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let mut sink = self.shared.sink.lock().await;
                        if let Some(s) = sink.as_mut() {
                            let _ = s.send(Message::Pong(payload)).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) => return Ok(()),
                    Some(Ok(_)) => {}
                },
                _ = sleep_until(ack_deadline.unwrap_or(now)), if ack_deadline.is_some() => {
                    self.on_ack_timer().await;
                }
                _ = sleep_until(journal_deadline.unwrap_or(now)), if journal_deadline.is_some() => {
                    self.on_journal_timer().await;
                }
                _ = sleep_until(keepalive_deadline.unwrap_or(now)), if keepalive_deadline.is_some() => {
                    self.on_keepalive_timer().await;
                }
            }
        }
    }

    /// Handle one inbound chunk; returns the application message, if any.
    ///
    /// Guarded against reentrance: the processor awaits while handling jet
    /// commands, and a second entry would corrupt the index bookkeeping.
    async fn process_inbound(&self, chunk: Bytes) -> Result<Option<Bytes>, PwsError> {
        let mut st = self.shared.state.lock().await;
        if st.ipi {
            error!(log_id = %self.shared.log_id, "B32125 inbound processor re-entered; chunk dropped");
            return Ok(None);
        }
        st.ipi = true;
        let result = self.dispatch_inbound(&mut st, chunk).await;
        st.ipi = false;
        result
    }

    async fn dispatch_inbound(
        &self,
        st: &mut State,
        chunk: Bytes,
    ) -> Result<Option<Bytes>, PwsError> {
        if chunk.len() < 2 {
            return Err(PwsError::Protocol("chunk shorter than its header".to_owned()));
        }
        let header = wire::decode_header(&chunk);
        trace!(
            log_id = %self.shared.log_id,
            dump = %printable_hex(&chunk[..chunk.len().min(16)]),
            "inbound chunk"
        );
        if wire::is_signal(header) {
            return self.handle_signal(st, header, &chunk).await;
        }

        let index = wire::unmod(wire::index_lsb(header), st.in_index);
        match index.cmp(&st.in_index) {
            std::cmp::Ordering::Less => {
                trace!(index, in_index = st.in_index, "duplicate chunk dropped");
                Ok(None)
            }
            std::cmp::Ordering::Greater => {
                // a gap: at least one chunk was lost in flight
                self.send_resend(st).await;
                Ok(None)
            }
            std::cmp::Ordering::Equal => {
                st.in_index += 1;
                st.ack_timer.arm(ACK_TIMEOUT);
                if st.in_index - st.in_last_ack >= ACK_EVERY {
                    self.send_ack(st).await;
                }
                let payload = chunk.slice(2..);
                if wire::is_jet_command(header) {
                    self.handle_jet_command(st, &payload)?;
                    Ok(None)
                } else if wire::is_jet(header) {
                    if self.shared.jet_tx.send(payload).is_err() {
                        trace!("jet bytes dropped; no consumer");
                    }
                    Ok(None)
                } else {
                    Ok(Some(payload))
                }
            }
        }
    }

    async fn handle_signal(
        &self,
        st: &mut State,
        code: u16,
        chunk: &Bytes,
    ) -> Result<Option<Bytes>, PwsError> {
        match code {
            wire::SIG_ACK | wire::SIG_RESEND => {
                if chunk.len() < 4 {
                    return Err(PwsError::Protocol("ack signal without an index".to_owned()));
                }
                let ack_lsb = u16::from_be_bytes([chunk[2], chunk[3]]);
                let ack_index = wire::unmod(ack_lsb, st.journal.next_index());
                if ack_index > st.journal.next_index() || ack_index < st.journal.tail_index() {
                    if code == wire::SIG_RESEND {
                        // the peer wants chunks we no longer hold; tell it
                        // before giving up ourselves
                        self.transmit(signal_frame(wire::SIG_RESEND_ERROR, &[])).await;
                    }
                    return Err(PwsError::Protocol(format!(
                        "peer referenced impossible index {ack_index}; journal holds {}..{}",
                        st.journal.tail_index(),
                        st.journal.next_index()
                    )));
                }
                st.journal.drop_through(ack_index)?;
                st.journal_timer.reset();
                if !st.journal.is_empty() {
                    st.journal_timer.restart();
                }
                if code == wire::SIG_RESEND {
                    let to = st.journal.next_index();
                    info!(
                        log_id = %self.shared.log_id,
                        from = ack_index,
                        count = to - ack_index,
                        "peer requested resend"
                    );
                    let frames: Vec<Bytes> =
                        st.journal.iter_range(ack_index, to).cloned().collect();
                    for frame in frames {
                        self.transmit(frame).await;
                    }
                }
                Ok(None)
            }
            wire::SIG_RESEND_ERROR => Err(PwsError::Protocol(
                "peer could not satisfy our resend request".to_owned(),
            )),
            wire::SIG_PING => {
                self.transmit(signal_frame(wire::SIG_PONG, &chunk[2..])).await;
                Ok(None)
            }
            wire::SIG_PONG => {
                trace!(log_id = %self.shared.log_id, "pong");
                Ok(None)
            }
            other => {
                warn!(log_id = %self.shared.log_id, code = other, "B32126 unknown signal ignored");
                Ok(None)
            }
        }
    }

    /// Acknowledge everything below `in_index` and quiet the ack timer.
    async fn send_ack(&self, st: &mut State) {
        st.in_last_ack = st.in_index;
        st.ack_timer.cancel();
        trace!(log_id = %self.shared.log_id, next_expected = st.in_index, "ack");
        self.transmit(signal_frame(
            wire::SIG_ACK,
            &wire::lsb(st.in_index).to_be_bytes(),
        ))
        .await;
    }

    /// Ask the peer to retransmit from `in_index`, at most once per
    /// [`RESEND_DEBOUNCE`] while the index is unchanged.
    async fn send_resend(&self, st: &mut State) {
        let now = Instant::now();
        if st.in_last_resend == st.in_index
            && st
                .in_last_resend_time
                .is_some_and(|t| now.duration_since(t) < RESEND_DEBOUNCE)
        {
            return;
        }
        st.in_last_resend = st.in_index;
        st.in_last_resend_time = Some(now);
        debug!(log_id = %self.shared.log_id, from = st.in_index, "requesting resend");
        self.transmit(signal_frame(
            wire::SIG_RESEND,
            &wire::lsb(st.in_index).to_be_bytes(),
        ))
        .await;
    }

    fn handle_jet_command(&self, st: &mut State, payload: &Bytes) -> Result<(), PwsError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| PwsError::Protocol("jet command is not UTF-8".to_owned()))?;
        let command: JetCommand = text
            .parse()
            .map_err(|e| PwsError::Protocol(format!("bad jet command: {e}")))?;
        debug!(log_id = %self.shared.log_id, %command, "jet command");
        match command {
            JetCommand::Disconnect => {
                if let Some(pipe) = st.jet_pipe.take() {
                    pipe.disconnect();
                }
            }
            JetCommand::ForwardTo { host, port } => {
                if !self.shared.allow_port_forwarding.load(Ordering::SeqCst) {
                    warn!(log_id = %self.shared.log_id, "B61108 port forwarding requested but not allowed");
                    self.publish_error(
                        "peer requested port forwarding, which is disabled".to_owned(),
                    );
                    return Ok(());
                }
                if let Some(previous) = st.jet_pipe.take() {
                    previous.disconnect();
                }
                // subscribe before returning so no data chunk for the new
                // connection can slip past
                let jet_rx = self.shared.jet_tx.subscribe();
                st.jet_pipe = Some(JetPipe::spawn(
                    Arc::downgrade(&self.shared),
                    jet_rx,
                    host,
                    port,
                ));
            }
        }
        Ok(())
    }

    async fn send_channel(&self, payload: Bytes, jet: bool) {
        let mut backoff = Backoff::new(SEND_BACKOFF_INITIAL, SEND_BACKOFF_CAP);
        loop {
            {
                let mut st = self.shared.state.lock().await;
                if !st.journal.is_full() {
                    let mut frame = BytesMut::with_capacity(2 + payload.len());
                    frame.put_slice(&wire::encode_header(st.journal.next_index(), jet, false));
                    frame.put_slice(&payload);
                    let frame = frame.freeze();
                    let index = st.journal.append(frame.clone());
                    if st.journal_timer.deadline().is_none() && self.is_online() {
                        st.journal_timer.restart();
                        self.shared.timer_kick.notify_one();
                    }
                    trace!(log_id = %self.shared.log_id, index, jet, len = payload.len(), "queued");
                    if self.chaos_roll() {
                        warn!(log_id = %self.shared.log_id, "B54761 chaos fault; dropping the connection");
                        self.drop_socket().await;
                    }
                    // transmit under the state lock: wire order must follow
                    // index order even with concurrent senders
                    self.transmit(frame).await;
                    return;
                }
            }
            let wait = backoff.next();
            debug!(
                log_id = %self.shared.log_id,
                wait_ms = wait.as_millis() as u64,
                "journal full; backing off"
            );
            sleep(wait).await;
        }
    }

    /// Write a frame if a socket is attached; a failed write discards the
    /// socket and is otherwise ignored (retransmission covers the loss).
    async fn transmit(&self, frame: Bytes) {
        if self.is_offline() {
            return;
        }
        let mut guard = self.shared.sink.lock().await;
        let Some(sink) = guard.as_mut() else { return };
        if let Err(e) = sink.send(Message::Binary(frame)).await {
            debug!(log_id = %self.shared.log_id, error = %e, "transmit failed");
            *guard = None;
        }
    }

    fn emit_incoming(&self, message: Bytes) {
        let guard = self.shared.incoming_tx.lock().expect("incoming lock");
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(message);
        }
    }

    // -----------------------------------------------------------------------
    // Timer callbacks (invoked from the session loop only)
    // -----------------------------------------------------------------------

    async fn on_ack_timer(&self) {
        let mut st = self.shared.state.lock().await;
        if !st.ack_timer.expired() {
            return;
        }
        st.ack_timer.cancel();
        if st.in_index > st.in_last_ack {
            self.send_ack(&mut st).await;
        }
    }

    async fn on_journal_timer(&self) {
        let mut st = self.shared.state.lock().await;
        if !st.journal_timer.expired() {
            return;
        }
        if st.journal.is_empty() {
            st.journal_timer.reset();
            return;
        }
        st.journal_timer.tick();
        // one chunk per tick; flooding a freshly reconnected link helps no one
        let index = st.journal.tail_index();
        debug!(log_id = %self.shared.log_id, index, "retransmitting oldest unacked chunk");
        if let Some(frame) = st.journal.front().cloned() {
            self.transmit(frame).await;
        }
    }

    async fn on_keepalive_timer(&self) {
        let frame = {
            let mut st = self.shared.state.lock().await;
            let Some(timer) = st.keepalive.as_mut() else { return };
            if !timer.expired() {
                return;
            }
            timer.tick();
            signal_frame(wire::SIG_PING, b"")
        };
        self.transmit(frame).await;
    }

    // -----------------------------------------------------------------------
    // Chaos
    // -----------------------------------------------------------------------

    fn chaos_roll(&self) -> bool {
        let chaos = self.shared.chaos.load(Ordering::Relaxed);
        chaos > 0 && rand::thread_rng().gen_range(0..1000) < chaos
    }

    async fn chaos_strike(&self) -> bool {
        if self.chaos_roll() {
            warn!(log_id = %self.shared.log_id, "B54761 chaos fault; dropping the connection");
            self.drop_socket().await;
            true
        } else {
            false
        }
    }
}

impl PersistentWebSocket<ClientStream> {
    /// Client side: connect to `uri` and keep the conversation alive until a
    /// fatal error (or [`PersistentWebSocket::abandon_connection`]) ends it.
    ///
    /// Transient failures are reported on [`PersistentWebSocket::errors`] and
    /// retried forever.  On a fatal error the inbound stream is closed so a
    /// waiting RPC call aborts, and the error is returned.
    pub async fn connect(&self, uri: &str) -> Result<(), PwsError> {
        let _single = self.shared.connect_lock.lock().await;
        let mut abandoned = self.shared.abandoned.subscribe();
        let err = loop {
            let ws = match connect::reconnect(uri, &self.shared.error_tx, &mut abandoned).await {
                Ok(ws) => ws,
                Err(e) => break e,
            };
            let mut stream = match self.go_online(ws).await {
                Ok(stream) => stream,
                Err(e) => break e,
            };
            let result = self.listen(&mut stream).await;
            self.go_offline().await;
            match result {
                Ok(()) => {
                    info!(log_id = %self.shared.log_id, "connection closed; reconnecting");
                }
                Err(e) if e.is_fatal() => break e,
                Err(e) => {
                    warn!(log_id = %self.shared.log_id, error = %e, "connection lost; reconnecting");
                    let _ = self.shared.error_tx.send(e.to_string());
                }
            }
        };
        self.seal(&err).await;
        Err(err)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn signal_frame(code: u16, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(2 + payload.len());
    frame.put_slice(&wire::encode_signal(code));
    frame.put_slice(payload);
    frame.freeze()
}

/// Broadcast receiver as a stream, logging (and skipping) lag.
fn drain_lag<V: Clone + Send + 'static>(
    rx: broadcast::Receiver<V>,
    what: &'static str,
) -> impl Stream<Item = V> + Send + 'static {
    use tokio_stream::wrappers::BroadcastStream;
    use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

    tokio_stream::StreamExt::filter_map(BroadcastStream::new(rx), move |item| match item {
        Ok(value) => Some(value),
        Err(BroadcastStreamRecvError::Lagged(n)) => {
            warn!(n, what, "consumer lagged; items dropped");
            None
        }
    })
}
