//! Per-connection gateway state machine
//!
//! [`Shard`] performs no I/O and owns no timers. The runner task feeds it
//! transport events and the current time, sleeps until
//! [`Shard::next_deadline`], and executes whatever the shard pushed to its
//! outbox ([`Outgoing`]).

use crate::bucket::TokenBucket;
use crate::cache::{Cache, CacheKey, EntityKind};
use crate::codec::{Codec, CodecConfig};
use crate::config::{BackoffConfig, ConnectionConfig, GatewayConfig, ShardManagerConfig};
use crate::error::{ConnectionError, Error};
use crate::events::{EventSender, ShardEvent};
use crate::health::{HeartbeatMonitor, HeartbeatTick};
use crate::metrics::Metrics;
use crate::protocol::close_codes::NORMAL_CLOSURE;
use crate::protocol::{
    classify, Activity, CacheOp, DispatchEvent, GatewayEvent, IdentifyPayload, Intents,
    MemberRequest, MembersChunk, OpCode, OutboundFrame, Presence, RawPayload, Ready,
    ResumePayload, SessionAction, Status, VoiceStateUpdate,
};
use crate::protocol::dispatch::{GuildCreate, GuildDelete};
use crate::rest::gateway_url;
use crate::sequential::SequentialBucket;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

/// Commands sent per 60 seconds on one connection
const GLOBAL_BUCKET_CAPACITY: u32 = 120;
const GLOBAL_BUCKET_REFILL: Duration = Duration::from_secs(60);
/// Part of the global budget only heartbeats, IDENTIFY and RESUME may use
const GLOBAL_BUCKET_RESERVED: u32 = 5;
/// Presence updates sent per 20 seconds
const PRESENCE_BUCKET_CAPACITY: u32 = 5;
const PRESENCE_BUCKET_REFILL: Duration = Duration::from_secs(20);
const NONCE_LENGTH: usize = 16;

/// Connection status of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardStatus {
    #[default]
    Disconnected,
    Connecting,
    Handshaking,
    Identifying,
    Resuming,
    Ready,
}

impl std::fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Identifying => "identifying",
            Self::Resuming => "resuming",
            Self::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Everything one shard needs from the manager configuration
#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub id: u32,
    pub total: u32,
    /// Connect URL with version, encoding and compression already applied
    pub url: String,
    pub token: String,
    pub intents: Intents,
    pub codec: CodecConfig,
    pub gateway: GatewayConfig,
    pub connection: ConnectionConfig,
    pub backoff: BackoffConfig,
}

impl ShardConfig {
    pub fn new(config: &ShardManagerConfig, id: u32, total: u32, url: String, codec: CodecConfig) -> Self {
        Self {
            id,
            total,
            url,
            token: config.token.clone(),
            intents: config.intents,
            codec,
            gateway: config.gateway.clone(),
            connection: config.connection.clone(),
            backoff: config.backoff.clone(),
        }
    }
}

/// Messages from a shard to its manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerSignal {
    /// Shard wants to (re)connect through the identify gate
    QueueConnect { resumable: bool },
    /// Handshake finished or was abandoned; the gate slot is free
    Released,
    /// Shard passed its readiness checks
    Ready,
    /// Shard is no longer ready
    NotReady,
}

/// Work the runner must carry out on the shard's behalf
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// Open a transport to this URL
    Open { url: String },
    /// Write an encoded frame
    Frame(Message),
    /// Close the transport gracefully
    Close { code: u16, reason: String },
    /// Drop the transport without a close handshake
    Terminate,
    /// Forward to the manager
    Notify(ManagerSignal),
}

/// Where a member-list response goes once complete
#[derive(Debug)]
pub enum MemberResponder {
    /// Caller awaiting the members
    Caller(oneshot::Sender<Vec<Value>>),
    /// Startup full member sync of a large guild
    FullSync,
}

#[derive(Debug)]
struct PendingRequest {
    guild_id: String,
    members: Vec<Value>,
    deadline: Instant,
    responder: MemberResponder,
}

#[derive(Debug)]
struct PendingFrame {
    frame: OutboundFrame,
    /// Buckets that still have to release this frame
    gates: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Closed,
    Opening,
    Open,
}

/// One gateway connection slot
pub struct Shard<C: Cache> {
    config: ShardConfig,
    cache: Arc<C>,
    events: EventSender,
    metrics: Arc<Metrics>,

    status: ShardStatus,
    sequence: u64,
    session_id: Option<String>,
    resume_url: Option<String>,
    connect_attempts: u32,
    reconnect_interval: Duration,
    heartbeat: HeartbeatMonitor,
    presence: Presence,

    transport: Transport,
    codec: Codec,
    connect_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,

    pending_requests: HashMap<String, PendingRequest>,
    /// Guilds listed in READY that have not streamed in yet
    pending_unavailable: HashSet<String>,
    guild_create_deadline: Option<Instant>,
    /// Guilds that went unavailable after startup
    unavailable_guilds: HashSet<String>,
    pending_full_sync: HashSet<String>,
    full_sync_queue: SequentialBucket<String>,
    pre_ready: bool,
    app_ready: bool,

    global_bucket: TokenBucket<u64>,
    presence_bucket: TokenBucket<u64>,
    frames: HashMap<u64, PendingFrame>,
    next_frame_id: u64,
    outbox: VecDeque<Outgoing>,
}

impl<C: Cache> Shard<C> {
    pub fn new(config: ShardConfig, cache: Arc<C>, events: EventSender, metrics: Arc<Metrics>) -> Self {
        let codec = Codec::new(config.codec);
        let presence = config.gateway.presence.clone();
        let reconnect_interval = config.backoff.initial_delay;
        Self {
            config,
            cache,
            events,
            metrics,
            status: ShardStatus::Disconnected,
            sequence: 0,
            session_id: None,
            resume_url: None,
            connect_attempts: 0,
            reconnect_interval,
            heartbeat: HeartbeatMonitor::new(),
            presence,
            transport: Transport::Closed,
            codec,
            connect_deadline: None,
            reconnect_at: None,
            pending_requests: HashMap::new(),
            pending_unavailable: HashSet::new(),
            guild_create_deadline: None,
            unavailable_guilds: HashSet::new(),
            pending_full_sync: HashSet::new(),
            full_sync_queue: SequentialBucket::new(1),
            pre_ready: false,
            app_ready: false,
            global_bucket: global_bucket(),
            presence_bucket: presence_bucket(),
            frames: HashMap::new(),
            next_frame_id: 0,
            outbox: VecDeque::new(),
        }
    }

    // ========== Accessors ==========

    pub fn id(&self) -> u32 {
        self.config.id
    }

    pub fn status(&self) -> ShardStatus {
        self.status
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    pub fn reconnect_interval(&self) -> Duration {
        self.reconnect_interval
    }

    pub fn latency(&self) -> Option<Duration> {
        self.heartbeat.latency()
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    /// Whether the shard finished its readiness checks on the current session
    pub fn is_ready(&self) -> bool {
        self.app_ready
    }

    pub fn is_connected(&self) -> bool {
        self.transport == Transport::Open
    }

    /// Next item for the runner to carry out
    pub fn next_outgoing(&mut self) -> Option<Outgoing> {
        self.outbox.pop_front()
    }

    /// Earliest instant at which [`Shard::poll_timers`] has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.connect_deadline,
            self.reconnect_at,
            self.heartbeat.next_deadline(),
            self.guild_create_deadline,
            self.global_bucket.next_deadline(),
            self.presence_bucket.next_deadline(),
            self.full_sync_queue.next_deadline(),
            self.pending_requests.values().map(|r| r.deadline).min(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // ========== Lifecycle ==========

    /// Open the transport, unless one is already live
    pub fn connect(&mut self, now: Instant) {
        if self.transport != Transport::Closed {
            warn!("[SHARD-{}] Connect requested while a connection is live", self.config.id);
            self.emit_warn("Existing connection detected");
            self.notify(ManagerSignal::Released);
            return;
        }

        self.reconnect_at = None;
        self.connect_attempts += 1;

        if self.config.token.is_empty() {
            self.disconnect(false, Some(ConnectionError::local("Token not specified")), now);
            return;
        }

        let url = match (&self.session_id, &self.resume_url) {
            (Some(_), Some(resume_url)) => resume_url.clone(),
            _ => self.config.url.clone(),
        };
        debug!(
            "[SHARD-{}] Connecting to {} (attempt {})",
            self.config.id, url, self.connect_attempts
        );
        self.status = ShardStatus::Connecting;
        self.transport = Transport::Opening;
        self.connect_deadline = Some(now + self.config.connection.connect_timeout);
        self.outbox.push_back(Outgoing::Open { url });
    }

    /// The transport handshake completed
    pub fn on_transport_open(&mut self, now: Instant) {
        if self.transport != Transport::Opening {
            trace!("[SHARD-{}] Ignoring stale transport open", self.config.id);
            return;
        }
        self.transport = Transport::Open;
        self.status = ShardStatus::Handshaking;
        self.codec.reset();
        self.metrics.record_connection();
        info!(
            "[SHARD-{}] Transport open, waiting for HELLO (deadline in {:?})",
            self.config.id,
            self.connect_deadline.map(|d| d.saturating_duration_since(now))
        );
        self.events.emit(ShardEvent::Connect {
            shard_id: self.config.id,
        });
    }

    /// The transport could not be opened
    pub fn on_transport_failed(&mut self, reason: &str, now: Instant) {
        if self.transport != Transport::Opening {
            return;
        }
        self.transport = Transport::Closed;
        warn!("[SHARD-{}] Failed to connect: {}", self.config.id, reason);
        self.disconnect(
            true,
            Some(ConnectionError::local(format!("Failed to connect: {}", reason))),
            now,
        );
    }

    /// The remote side closed the transport
    pub fn on_transport_closed(&mut self, code: u16, reason: &str, now: Instant) {
        if self.transport == Transport::Closed {
            trace!("[SHARD-{}] Ignoring close of a discarded transport", self.config.id);
            return;
        }
        self.transport = Transport::Closed;

        let disposition = classify(code, reason);
        info!(
            "[SHARD-{}] Transport closed with code {} (reconnect={})",
            self.config.id, code, disposition.reconnect
        );
        match disposition.session {
            SessionAction::Keep => {}
            SessionAction::Clear => self.forget_session(),
            SessionAction::ResetSequence => self.sequence = 0,
        }
        self.disconnect(disposition.reconnect, disposition.error, now);
    }

    /// Tear the connection down and decide whether and how to come back.
    pub fn disconnect(&mut self, reconnect: bool, error: Option<ConnectionError>, now: Instant) {
        self.heartbeat.stop();

        if self.transport != Transport::Closed {
            if reconnect && self.session_id.is_some() {
                // An abrupt drop keeps the session resumable
                self.outbox.push_back(Outgoing::Terminate);
            } else if self.transport == Transport::Open {
                self.outbox.push_back(Outgoing::Close {
                    code: NORMAL_CLOSURE,
                    reason: String::new(),
                });
            } else {
                self.outbox.push_back(Outgoing::Terminate);
            }
            self.transport = Transport::Closed;
        }

        self.reset();

        if let Some(err) = &error {
            self.metrics.record_error();
            if err.is_fatal() {
                error!("[SHARD-{}] Fatal gateway error: {}", self.config.id, err);
            } else {
                debug!("[SHARD-{}] Disconnect error: {}", self.config.id, err);
            }
            self.events.emit(ShardEvent::Error {
                shard_id: self.config.id,
                error: err.clone(),
                fatal: err.is_fatal(),
            });
        }

        if self.session_id.is_some() && self.connect_attempts >= self.config.connection.max_resume_attempts {
            info!(
                "[SHARD-{}] Forgetting session after {} attempts",
                self.config.id, self.connect_attempts
            );
            self.forget_session();
        }

        self.notify(ManagerSignal::NotReady);
        self.notify(ManagerSignal::Released);

        let mut reconnecting = reconnect && self.config.connection.auto_reconnect;
        if reconnecting {
            if let Some(max) = self.config.connection.max_reconnect_attempts {
                if self.connect_attempts >= max {
                    let failed = Error::ConnectionFailed {
                        attempts: self.connect_attempts,
                        last_error: error
                            .as_ref()
                            .map_or_else(|| "disconnected".to_string(), ToString::to_string),
                    };
                    error!("[SHARD-{}] {}", self.config.id, failed);
                    self.events.emit(ShardEvent::Error {
                        shard_id: self.config.id,
                        error: ConnectionError::local(failed.to_string()).with_fatal(true),
                        fatal: true,
                    });
                    reconnecting = false;
                }
            }
        }

        if reconnecting {
            self.metrics.record_reconnection();
            if self.session_id.is_some() {
                debug!("[SHARD-{}] Queueing resume", self.config.id);
                self.notify(ManagerSignal::QueueConnect { resumable: true });
            } else {
                debug!(
                    "[SHARD-{}] Reconnecting in {:?}",
                    self.config.id, self.reconnect_interval
                );
                self.reconnect_at = Some(now + self.reconnect_interval);
                self.reconnect_interval = self.config.backoff.next_delay(self.reconnect_interval);
            }
        } else {
            self.hard_reset();
        }

        self.events.emit(ShardEvent::Disconnect {
            shard_id: self.config.id,
            error,
            reconnecting,
        });
    }

    /// Per-connection reinitialization; the session survives
    pub fn reset(&mut self) {
        self.heartbeat.reset();
        self.connect_deadline = None;
        self.status = ShardStatus::Disconnected;
        self.codec.reset();

        for (_, request) in self.pending_requests.drain() {
            if let MemberResponder::Caller(tx) = request.responder {
                let _ = tx.send(request.members);
            }
        }
        self.pending_unavailable.clear();
        self.guild_create_deadline = None;
        self.pending_full_sync.clear();
        self.full_sync_queue.clear();
        self.pre_ready = false;
        self.app_ready = false;

        self.global_bucket.clear();
        self.presence_bucket.clear();
        self.frames.clear();
    }

    /// Full reinitialization: session, counters and rate limits start over
    pub fn hard_reset(&mut self) {
        self.reset();
        self.sequence = 0;
        self.session_id = None;
        self.resume_url = None;
        self.connect_attempts = 0;
        self.reconnect_interval = self.config.backoff.initial_delay;
        self.reconnect_at = None;
        self.unavailable_guilds.clear();
        self.presence = self.config.gateway.presence.clone();
        self.global_bucket = global_bucket();
        self.presence_bucket = presence_bucket();
    }

    // ========== Timers ==========

    /// Run every timer due at `now`
    pub fn poll_timers(&mut self, now: Instant) {
        if self.connect_deadline.is_some_and(|at| at <= now) {
            self.connect_deadline = None;
            warn!("[SHARD-{}] No HELLO before the connect timeout", self.config.id);
            self.disconnect(true, Some(ConnectionError::local("Connection timeout")), now);
        }

        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            self.notify(ManagerSignal::QueueConnect {
                resumable: self.session_id.is_some(),
            });
        }

        if self.heartbeat.is_due(now) {
            self.heartbeat_tick(now);
        }

        if self.guild_create_deadline.is_some_and(|at| at <= now) {
            self.guild_create_deadline = None;
            if !self.pending_unavailable.is_empty() {
                debug!(
                    "[SHARD-{}] {} guilds still unavailable after the guild create timeout",
                    self.config.id,
                    self.pending_unavailable.len()
                );
                self.pending_unavailable.clear();
            }
            self.check_ready(now);
        }

        let expired: Vec<String> = self
            .pending_requests
            .iter()
            .filter(|(_, request)| request.deadline <= now)
            .map(|(nonce, _)| nonce.clone())
            .collect();
        for nonce in expired {
            debug!("[SHARD-{}] Member request {} timed out", self.config.id, nonce);
            self.resolve_request(&nonce, now);
        }

        self.start_full_syncs(now);
        self.pump(now);
    }

    fn heartbeat_tick(&mut self, now: Instant) {
        match self.heartbeat.tick(now) {
            HeartbeatTick::Send => self.send_heartbeat(now),
            HeartbeatTick::Missed => {
                self.metrics.record_heartbeat_missed();
                warn!("[SHARD-{}] Heartbeat was not acknowledged", self.config.id);
                self.disconnect(
                    true,
                    Some(ConnectionError::local(
                        "Server didn't acknowledge previous heartbeat, possible lost connection",
                    )),
                    now,
                );
            }
        }
    }

    fn send_heartbeat(&mut self, now: Instant) {
        let seq = (self.sequence > 0).then_some(self.sequence);
        self.metrics.record_heartbeat();
        if let Err(e) = self.send(OpCode::Heartbeat, seq, true, now) {
            warn!("[SHARD-{}] Failed to queue heartbeat: {}", self.config.id, e);
        }
    }

    // ========== Inbound ==========

    /// Handle one transport message
    pub fn on_message(&mut self, message: Message, now: Instant) {
        self.metrics.record_message_received();
        let raw = match self.codec.decode(message) {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(Error::Decompress(reason)) => {
                warn!("[SHARD-{}] Decompression failed: {}", self.config.id, reason);
                self.disconnect(
                    true,
                    Some(ConnectionError::local(format!("Decompression failed: {}", reason))),
                    now,
                );
                return;
            }
            Err(e) => {
                warn!("[SHARD-{}] Undecodable frame: {}", self.config.id, e);
                self.emit_warn(format!("Undecodable frame: {}", e));
                return;
            }
        };
        self.handle_payload(raw, now);
    }

    fn handle_payload(&mut self, raw: RawPayload, now: Instant) {
        if let Some(seq) = raw.s {
            if self.sequence != 0 && seq != self.sequence + 1 && self.status != ShardStatus::Resuming {
                warn!(
                    "[SHARD-{}] Non-consecutive sequence ({} -> {})",
                    self.config.id, self.sequence, seq
                );
                self.emit_warn(format!("Non-consecutive sequence ({} -> {})", self.sequence, seq));
            }
            self.sequence = seq;
        }

        let event = match GatewayEvent::from_raw(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!("[SHARD-{}] {}", self.config.id, e);
                self.emit_warn(e.to_string());
                return;
            }
        };

        match event {
            GatewayEvent::Dispatch { name, data } => self.handle_dispatch(name, data, now),
            GatewayEvent::Heartbeat => {
                debug!("[SHARD-{}] Gateway requested a heartbeat", self.config.id);
                self.heartbeat.record_immediate(now);
                self.send_heartbeat(now);
            }
            GatewayEvent::HeartbeatAck => {
                self.heartbeat.record_ack(now);
                self.metrics.record_heartbeat_ack();
                if let Some(latency) = self.heartbeat.latency() {
                    self.global_bucket.set_latency_ref(latency);
                }
                trace!(
                    "[SHARD-{}] Heartbeat acknowledged ({:?})",
                    self.config.id,
                    self.heartbeat.latency()
                );
            }
            GatewayEvent::Hello { heartbeat_interval } => self.on_hello(heartbeat_interval, now),
            GatewayEvent::InvalidSession { resumable } => {
                self.metrics.record_invalid_session();
                info!(
                    "[SHARD-{}] Invalid session (resumable={})",
                    self.config.id, resumable
                );
                if resumable && self.session_id.is_some() {
                    self.resume(now);
                } else {
                    self.forget_session();
                    self.identify(now);
                }
            }
            GatewayEvent::Reconnect => {
                info!("[SHARD-{}] Gateway requested a reconnect", self.config.id);
                self.disconnect(true, None, now);
            }
            GatewayEvent::Unknown { op } => {
                debug!("[SHARD-{}] Unhandled op code {}", self.config.id, op);
            }
        }
    }

    fn on_hello(&mut self, heartbeat_interval: u64, now: Instant) {
        self.connect_deadline = None;
        let interval = Duration::from_millis(heartbeat_interval);
        self.heartbeat.start(interval, now);
        debug!("[SHARD-{}] HELLO, heartbeating every {:?}", self.config.id, interval);
        self.events.emit(ShardEvent::Hello {
            shard_id: self.config.id,
            heartbeat_interval,
        });

        if self.session_id.is_some() {
            self.resume(now);
        } else {
            self.identify(now);
        }
    }

    fn identify(&mut self, now: Instant) {
        // A new session always counts from zero
        self.sequence = 0;
        self.status = ShardStatus::Identifying;
        let payload = IdentifyPayload {
            token: self.config.token.clone(),
            properties: self.config.gateway.properties.clone(),
            compress: false,
            large_threshold: self.config.gateway.large_threshold,
            shard: [self.config.id, self.config.total],
            presence: self.presence.clone(),
            intents: self.config.intents,
        };
        info!("[SHARD-{}] Identifying", self.config.id);
        self.metrics.record_identify();
        if let Err(e) = self.send(OpCode::Identify, payload, true, now) {
            warn!("[SHARD-{}] Failed to queue IDENTIFY: {}", self.config.id, e);
            return;
        }
        self.heartbeat.record_immediate(now);
        self.send_heartbeat(now);
    }

    fn resume(&mut self, now: Instant) {
        let Some(session_id) = self.session_id.clone() else {
            self.identify(now);
            return;
        };
        self.status = ShardStatus::Resuming;
        let payload = ResumePayload {
            token: self.config.token.clone(),
            session_id,
            seq: self.sequence,
        };
        info!("[SHARD-{}] Resuming at sequence {}", self.config.id, self.sequence);
        self.metrics.record_resume();
        if let Err(e) = self.send(OpCode::Resume, payload, true, now) {
            warn!("[SHARD-{}] Failed to queue RESUME: {}", self.config.id, e);
        }
    }

    fn handle_dispatch(&mut self, name: String, data: Value, now: Instant) {
        let event = match DispatchEvent::decode(&name, data) {
            Ok(event) => event,
            Err(e) => {
                warn!("[SHARD-{}] {}", self.config.id, e);
                self.emit_warn(e.to_string());
                return;
            }
        };

        match event {
            DispatchEvent::Ready(ready) => self.on_ready(ready, now),
            DispatchEvent::Resumed => self.on_resumed(),
            DispatchEvent::GuildCreate(guild) => self.on_guild_create(guild, now),
            DispatchEvent::GuildDelete(guild) => self.on_guild_delete(guild),
            DispatchEvent::GuildMembersChunk(chunk) => self.on_members_chunk(chunk, now),
            DispatchEvent::Entity { kind, data } => {
                let (new, old) = match kind.cache_op(&data) {
                    CacheOp::Upsert { key, delta } => {
                        let (new, old) = self.cache.update(key, delta);
                        (Some(new), old)
                    }
                    CacheOp::Remove { key } => (None, self.cache.remove(&key).or(Some(data))),
                    CacheOp::Emit => (Some(data), None),
                };
                self.emit_dispatch(kind.as_str(), new, old);
            }
            DispatchEvent::Unknown { name, data } => {
                trace!("[SHARD-{}] Unknown dispatch {}", self.config.id, name);
                self.emit_dispatch(&name, Some(data), None);
            }
        }
    }

    fn on_ready(&mut self, ready: Ready, now: Instant) {
        self.connect_attempts = 0;
        self.reconnect_interval = self.config.backoff.initial_delay;
        self.status = ShardStatus::Ready;
        self.session_id = Some(ready.session_id);
        self.resume_url = ready.resume_gateway_url.and_then(|url| {
            gateway_url(&url, self.config.gateway.version, self.config.codec)
                .map_err(|e| warn!("[SHARD-{}] Ignoring resume URL: {}", self.config.id, e))
                .ok()
        });

        if let Some(user_id) = ready.user.get("id").and_then(Value::as_str) {
            self.cache
                .update(CacheKey::new(EntityKind::User, user_id), ready.user.clone());
        }

        self.pending_unavailable = ready.guilds.into_iter().map(|g| g.id).collect();
        self.pre_ready = true;
        self.app_ready = false;
        info!(
            "[SHARD-{}] READY, waiting for {} guilds",
            self.config.id,
            self.pending_unavailable.len()
        );
        self.events.emit(ShardEvent::PreReady {
            shard_id: self.config.id,
        });
        self.notify(ManagerSignal::Released);

        if self.pending_unavailable.is_empty() {
            self.check_ready(now);
        } else {
            self.guild_create_deadline = Some(now + self.config.gateway.guild_create_timeout);
        }
    }

    fn on_resumed(&mut self) {
        self.connect_attempts = 0;
        self.reconnect_interval = self.config.backoff.initial_delay;
        self.status = ShardStatus::Ready;
        self.pre_ready = true;
        self.app_ready = true;
        info!("[SHARD-{}] Resumed at sequence {}", self.config.id, self.sequence);
        self.events.emit(ShardEvent::Resumed {
            shard_id: self.config.id,
        });
        self.notify(ManagerSignal::Released);
        self.notify(ManagerSignal::Ready);
    }

    fn on_guild_create(&mut self, guild: GuildCreate, now: Instant) {
        let large = guild.is_large(self.config.gateway.large_threshold);
        let GuildCreate { id, data, .. } = guild;
        let (new, old) = self.cache.update(CacheKey::new(EntityKind::Guild, id.clone()), data);

        if !self.app_ready && large && self.config.gateway.fetch_all_members {
            if self.config.intents.contains(Intents::GUILD_MEMBERS) {
                if self.pending_full_sync.insert(id.clone()) {
                    self.full_sync_queue.queue(id.clone(), false);
                }
            } else {
                warn!(
                    "[SHARD-{}] Cannot fetch members of {} without the GUILD_MEMBERS intent",
                    self.config.id, id
                );
            }
        }

        let name = if self.unavailable_guilds.remove(&id) {
            "GUILD_AVAILABLE"
        } else {
            "GUILD_CREATE"
        };

        if self.pending_unavailable.remove(&id) {
            if self.pending_unavailable.is_empty() {
                self.guild_create_deadline = None;
                self.check_ready(now);
            } else {
                self.guild_create_deadline = Some(now + self.config.gateway.guild_create_timeout);
            }
        } else {
            self.start_full_syncs(now);
        }

        self.emit_dispatch(name, Some(new), old);
    }

    fn on_guild_delete(&mut self, guild: GuildDelete) {
        let key = CacheKey::new(EntityKind::Guild, guild.id.clone());
        if guild.unavailable {
            let (new, old) = self.cache.update(key, serde_json::json!({ "unavailable": true }));
            self.unavailable_guilds.insert(guild.id);
            self.emit_dispatch("GUILD_UNAVAILABLE", Some(new), old);
        } else {
            let old = self.cache.remove(&key);
            self.unavailable_guilds.remove(&guild.id);
            self.emit_dispatch("GUILD_DELETE", None, old);
        }
    }

    fn on_members_chunk(&mut self, chunk: MembersChunk, now: Instant) {
        for member in &chunk.members {
            if let Some(user_id) = member.pointer("/user/id").and_then(Value::as_str) {
                self.cache.update(
                    CacheKey::scoped(EntityKind::Member, &chunk.guild_id, user_id),
                    member.clone(),
                );
            }
        }

        if !chunk.not_found.is_empty() {
            debug!(
                "[SHARD-{}] {} requested members of {} not found",
                self.config.id,
                chunk.not_found.len(),
                chunk.guild_id
            );
        }

        let is_last = chunk.is_last();
        let MembersChunk { members, nonce, .. } = chunk;
        self.emit_dispatch("GUILD_MEMBERS_CHUNK", Some(Value::Array(members.clone())), None);

        let Some(nonce) = nonce else {
            return;
        };
        let Some(request) = self.pending_requests.get_mut(&nonce) else {
            trace!("[SHARD-{}] Chunk for unknown nonce {}", self.config.id, nonce);
            return;
        };
        request.members.extend(members);
        if is_last {
            self.resolve_request(&nonce, now);
        }
    }

    fn resolve_request(&mut self, nonce: &str, now: Instant) {
        let Some(request) = self.pending_requests.remove(nonce) else {
            return;
        };
        match request.responder {
            MemberResponder::Caller(tx) => {
                let _ = tx.send(request.members);
            }
            MemberResponder::FullSync => {
                debug!(
                    "[SHARD-{}] Fetched {} members of guild {}",
                    self.config.id,
                    request.members.len(),
                    request.guild_id
                );
                self.pending_full_sync.remove(&request.guild_id);
                self.full_sync_queue.complete();
                self.start_full_syncs(now);
                self.check_ready(now);
            }
        }
    }

    /// Start the next queued full member sync, one at a time
    fn start_full_syncs(&mut self, now: Instant) {
        if self.transport != Transport::Open {
            return;
        }
        while let Some(guild_id) = self.full_sync_queue.poll(now) {
            if let Err(e) =
                self.request_guild_members(guild_id.clone(), MemberRequest::all(), MemberResponder::FullSync, now)
            {
                warn!(
                    "[SHARD-{}] Could not fetch members of {}: {}",
                    self.config.id, guild_id, e
                );
                self.pending_full_sync.remove(&guild_id);
                self.full_sync_queue.complete();
                continue;
            }
            break;
        }
    }

    fn check_ready(&mut self, now: Instant) {
        if self.app_ready || !self.pre_ready || !self.pending_unavailable.is_empty() {
            return;
        }
        if !self.pending_full_sync.is_empty() {
            self.start_full_syncs(now);
            return;
        }

        self.app_ready = true;
        info!("[SHARD-{}] Ready", self.config.id);
        self.events.emit(ShardEvent::Ready {
            shard_id: self.config.id,
        });
        self.notify(ManagerSignal::Ready);
    }

    // ========== Outbound ==========

    /// Request a guild's member list; chunks are delivered to `responder`
    pub fn request_guild_members(
        &mut self,
        guild_id: String,
        request: MemberRequest,
        responder: MemberResponder,
        now: Instant,
    ) -> Result<(), Error> {
        request.validate(self.config.intents)?;
        if self.transport != Transport::Open {
            return Err(Error::NotConnected(self.config.id));
        }

        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LENGTH)
            .map(char::from)
            .collect();
        let deadline = now + request.timeout.unwrap_or(self.config.gateway.request_timeout);
        let payload = request.into_payload(guild_id.clone(), nonce.clone());
        self.send(OpCode::RequestGuildMembers, payload, false, now)?;

        self.pending_requests.insert(
            nonce,
            PendingRequest {
                guild_id,
                members: Vec::new(),
                deadline,
                responder,
            },
        );
        Ok(())
    }

    /// Change the presence; stored for future IDENTIFYs and sent now if connected
    pub fn edit_status(&mut self, status: Status, activities: Vec<Activity>, now: Instant) -> Result<(), Error> {
        self.presence.status = status;
        self.presence.activities = activities;
        if self.transport != Transport::Open {
            return Ok(());
        }
        let presence = self.presence.clone();
        self.send(OpCode::PresenceUpdate, presence, false, now)
    }

    /// Join, move between or leave voice channels
    pub fn update_voice_state(&mut self, update: VoiceStateUpdate, now: Instant) -> Result<(), Error> {
        if self.transport != Transport::Open {
            return Err(Error::NotConnected(self.config.id));
        }
        self.send(OpCode::VoiceStateUpdate, update, false, now)
    }

    /// Queue a frame on the global bucket, and on the presence bucket for presence updates
    fn send(&mut self, op: OpCode, payload: impl Serialize, priority: bool, now: Instant) -> Result<(), Error> {
        let frame = OutboundFrame::new(op, payload)?;
        debug!("[SHARD-{}] Queueing {}: {}", self.config.id, op, frame.redacted());

        let id = self.next_frame_id;
        self.next_frame_id += 1;

        self.global_bucket.queue(id, priority)?;
        let mut gates = 1;
        if op == OpCode::PresenceUpdate {
            if let Err(e) = self.presence_bucket.queue(id, false) {
                self.global_bucket.remove(&id);
                return Err(e);
            }
            gates += 1;
        }
        self.frames.insert(id, PendingFrame { frame, gates });
        self.pump(now);
        Ok(())
    }

    /// Write every frame all of whose buckets have released it
    fn pump(&mut self, now: Instant) {
        let mut released = self.global_bucket.drain(now);
        released.extend(self.presence_bucket.drain(now));

        for id in released {
            let Some(pending) = self.frames.get_mut(&id) else {
                continue;
            };
            pending.gates -= 1;
            if pending.gates > 0 {
                continue;
            }
            if let Some(pending) = self.frames.remove(&id) {
                match self.codec.encode(&pending.frame) {
                    Ok(message) => self.outbox.push_back(Outgoing::Frame(message)),
                    Err(e) => warn!(
                        "[SHARD-{}] Failed to encode {}: {}",
                        self.config.id, pending.frame.op, e
                    ),
                }
            }
        }
    }

    // ========== Helpers ==========

    fn forget_session(&mut self) {
        self.session_id = None;
        self.sequence = 0;
    }

    fn notify(&mut self, signal: ManagerSignal) {
        self.outbox.push_back(Outgoing::Notify(signal));
    }

    fn emit_warn(&self, message: impl Into<String>) {
        self.events.emit(ShardEvent::Warn {
            shard_id: self.config.id,
            message: message.into(),
        });
    }

    fn emit_dispatch(&self, name: &str, new: Option<Value>, old: Option<Value>) {
        self.events.emit(ShardEvent::Dispatch {
            shard_id: self.config.id,
            name: name.to_string(),
            new,
            old,
        });
    }

    /// Publish this shard's gauges
    pub(crate) fn sync_metrics(&self) {
        let connected = self.transport == Transport::Open;
        self.metrics.update_shard(self.config.id, |s| {
            s.status = self.status;
            s.latency = self.heartbeat.latency();
            s.sequence = self.sequence;
            s.connect_attempts = self.connect_attempts;
            s.set_connected(connected);
        });
    }
}

fn global_bucket() -> TokenBucket<u64> {
    TokenBucket::new(GLOBAL_BUCKET_CAPACITY, GLOBAL_BUCKET_REFILL).with_reserved(GLOBAL_BUCKET_RESERVED)
}

fn presence_bucket() -> TokenBucket<u64> {
    TokenBucket::new(PRESENCE_BUCKET_CAPACITY, PRESENCE_BUCKET_REFILL)
}
