use crate::cache::Cache;
use crate::config::ConnectionConfig;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::protocol::close_codes::ABNORMAL_CLOSURE;
use crate::protocol::{Activity, Intents, MemberRequest, Status, VoiceStateUpdate};
use crate::shard::{ManagerSignal, MemberResponder, Outgoing, Shard, ShardStatus};
use futures_util::{SinkExt, StreamExt};
use http::header::USER_AGENT;
use http::HeaderValue;
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::client::IntoClientRequest, tungstenite::Message,
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, trace, warn};
use url::Url;

/// Close code reported when the stream ends without a close frame
const NO_STATUS_RECEIVED: u16 = 1005;

/// Commands that can be sent to a shard task
#[derive(Debug)]
pub(crate) enum ShardCommand {
    /// Open the connection (issued by the identify gate)
    Connect,
    /// Drop the connection, optionally coming back
    Disconnect { reconnect: bool },
    /// Change the presence
    EditStatus {
        status: Status,
        activities: Vec<Activity>,
        respond_to: oneshot::Sender<Result<(), Error>>,
    },
    /// Fetch a guild's member list
    RequestGuildMembers {
        guild_id: String,
        request: MemberRequest,
        respond_to: oneshot::Sender<Result<oneshot::Receiver<Vec<Value>>, Error>>,
    },
    /// Send a voice state update
    UpdateVoiceState {
        update: VoiceStateUpdate,
        respond_to: oneshot::Sender<Result<(), Error>>,
    },
    /// Hard-reset the shard and end its task
    Shutdown,
}

/// Cloneable handle to one running shard
#[derive(Debug, Clone)]
pub struct ShardHandle {
    id: u32,
    intents: Intents,
    commands: mpsc::Sender<ShardCommand>,
    metrics: Arc<Metrics>,
}

impl ShardHandle {
    pub(crate) fn new(id: u32, intents: Intents, commands: mpsc::Sender<ShardCommand>, metrics: Arc<Metrics>) -> Self {
        Self {
            id,
            intents,
            commands,
            metrics,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Last published status of the shard
    pub fn status(&self) -> ShardStatus {
        self.metrics
            .shard(self.id)
            .map_or(ShardStatus::Disconnected, |s| s.status)
    }

    /// Latest heartbeat round trip
    pub fn latency(&self) -> Option<Duration> {
        self.metrics.shard(self.id).and_then(|s| s.latency)
    }

    /// Change this shard's presence
    pub async fn edit_status(&self, status: Status, activities: Vec<Activity>) -> Result<(), Error> {
        let (respond_to, rx) = oneshot::channel();
        self.send(ShardCommand::EditStatus {
            status,
            activities,
            respond_to,
        })
        .await?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Fetch members of a guild on this shard.
    ///
    /// Invalid requests are rejected before anything is sent. Resolves with
    /// whatever arrived when the request times out.
    pub async fn request_guild_members(
        &self,
        guild_id: impl Into<String>,
        request: MemberRequest,
    ) -> Result<Vec<Value>, Error> {
        request.validate(self.intents)?;
        let (respond_to, rx) = oneshot::channel();
        self.send(ShardCommand::RequestGuildMembers {
            guild_id: guild_id.into(),
            request,
            respond_to,
        })
        .await?;
        let members = rx.await.map_err(|_| Error::ShuttingDown)??;
        members.await.map_err(|_| Error::ShuttingDown)
    }

    /// Join, move between or leave (`channel_id: None`) a voice channel
    pub async fn update_voice_state(
        &self,
        guild_id: impl Into<String>,
        channel_id: Option<String>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<(), Error> {
        let update = VoiceStateUpdate {
            guild_id: guild_id.into(),
            channel_id,
            self_mute,
            self_deaf,
        };
        let (respond_to, rx) = oneshot::channel();
        self.send(ShardCommand::UpdateVoiceState { update, respond_to })
            .await?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Drop the connection; `reconnect` decides whether it comes back
    pub async fn disconnect(&self, reconnect: bool) -> Result<(), Error> {
        self.send(ShardCommand::Disconnect { reconnect }).await
    }

    pub(crate) async fn send(&self, command: ShardCommand) -> Result<(), Error> {
        self.commands
            .send(command)
            .await
            .map_err(|e| Error::ChannelSend(format!("shard {} is not running: {}", self.id, e)))
    }
}

/// What woke the runner
enum Step {
    Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
    Command(ShardCommand),
    Timer,
}

/// Task owning one shard and its socket
pub(crate) struct ShardRunner<C: Cache> {
    shard: Shard<C>,
    socket: Option<WsStream>,
    commands: mpsc::Receiver<ShardCommand>,
    signals: mpsc::UnboundedSender<(u32, ManagerSignal)>,
    config: ConnectionConfig,
    metrics: Arc<Metrics>,
}

impl<C: Cache> ShardRunner<C> {
    pub(crate) fn new(
        shard: Shard<C>,
        commands: mpsc::Receiver<ShardCommand>,
        signals: mpsc::UnboundedSender<(u32, ManagerSignal)>,
        config: ConnectionConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            shard,
            socket: None,
            commands,
            signals,
            config,
            metrics,
        }
    }

    /// Drive the shard until it is shut down
    pub(crate) async fn run(mut self) {
        let shard_id = self.shard.id();
        debug!("[SHARD-{}] Runner started", shard_id);
        self.shard.sync_metrics();

        loop {
            let deadline = self.shard.next_deadline();
            let step = tokio::select! {
                frame = next_frame(&mut self.socket) => Step::Frame(frame),
                command = self.commands.recv() => Step::Command(command.unwrap_or(ShardCommand::Shutdown)),
                _ = sleep_until(deadline) => Step::Timer,
            };

            let now = Instant::now();
            let mut stop = false;
            match step {
                Step::Frame(frame) => self.on_frame(frame, now).await,
                Step::Command(command) => stop = self.on_command(command, now),
                Step::Timer => self.shard.poll_timers(now),
            }

            self.flush().await;
            self.shard.sync_metrics();
            if stop {
                break;
            }
        }

        info!("[SHARD-{}] Runner stopped", shard_id);
    }

    async fn on_frame(
        &mut self,
        frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
        now: Instant,
    ) {
        match frame {
            Some(Ok(Message::Ping(data))) => {
                trace!("[SHARD-{}] Received ping, sending pong", self.shard.id());
                if let Some(ws) = self.socket.as_mut() {
                    if let Err(e) = ws.send(Message::Pong(data)).await {
                        debug!("[SHARD-{}] Failed to send pong: {}", self.shard.id(), e);
                    }
                }
            }
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                self.socket = None;
                let (code, reason) = match frame {
                    Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                    None => (NO_STATUS_RECEIVED, String::new()),
                };
                self.shard.on_transport_closed(code, &reason, now);
            }
            Some(Ok(message)) => self.shard.on_message(message, now),
            Some(Err(e)) => {
                warn!("[SHARD-{}] WebSocket error: {}", self.shard.id(), e);
                self.socket = None;
                self.shard.on_transport_closed(ABNORMAL_CLOSURE, &e.to_string(), now);
            }
            None => {
                info!("[SHARD-{}] WebSocket stream ended", self.shard.id());
                self.socket = None;
                self.shard.on_transport_closed(ABNORMAL_CLOSURE, "", now);
            }
        }
    }

    /// Returns true when the runner should stop
    fn on_command(&mut self, command: ShardCommand, now: Instant) -> bool {
        match command {
            ShardCommand::Connect => self.shard.connect(now),
            ShardCommand::Disconnect { reconnect } => self.shard.disconnect(reconnect, None, now),
            ShardCommand::EditStatus {
                status,
                activities,
                respond_to,
            } => {
                let _ = respond_to.send(self.shard.edit_status(status, activities, now));
            }
            ShardCommand::RequestGuildMembers {
                guild_id,
                request,
                respond_to,
            } => {
                let (tx, rx) = oneshot::channel();
                let result = self
                    .shard
                    .request_guild_members(guild_id, request, MemberResponder::Caller(tx), now)
                    .map(|()| rx);
                let _ = respond_to.send(result);
            }
            ShardCommand::UpdateVoiceState { update, respond_to } => {
                let _ = respond_to.send(self.shard.update_voice_state(update, now));
            }
            ShardCommand::Shutdown => {
                info!("[SHARD-{}] Shutting down", self.shard.id());
                self.shard.disconnect(false, None, now);
                return true;
            }
        }
        false
    }

    /// Carry out everything the shard queued
    async fn flush(&mut self) {
        while let Some(outgoing) = self.shard.next_outgoing() {
            match outgoing {
                Outgoing::Open { url } => self.open(&url).await,
                Outgoing::Frame(message) => self.write(message).await,
                Outgoing::Close { code, reason } => {
                    if let Some(mut ws) = self.socket.take() {
                        let frame = CloseFrame {
                            code: code.into(),
                            reason: reason.into(),
                        };
                        if let Err(e) = ws.close(Some(frame)).await {
                            debug!("[SHARD-{}] Close handshake failed: {}", self.shard.id(), e);
                        }
                    }
                }
                Outgoing::Terminate => {
                    if self.socket.take().is_some() {
                        debug!("[SHARD-{}] Connection terminated", self.shard.id());
                    }
                }
                Outgoing::Notify(signal) => {
                    if self.signals.send((self.shard.id(), signal)).is_err() {
                        trace!("[SHARD-{}] Manager gone, dropping {:?}", self.shard.id(), signal);
                    }
                }
            }
        }
    }

    async fn open(&mut self, url: &str) {
        let shard_id = self.shard.id();
        let source_ip = self.config.source_ip_for_shard(shard_id);
        debug!(
            "[SHARD-{}] Connecting to {} (source_ip={:?})",
            shard_id, url, source_ip
        );

        let dial = Dial {
            shard_id,
            attempt: self.shard.connect_attempts(),
            source_ip,
        };
        let result = timeout(self.config.connect_timeout, dial.websocket(url)).await;
        let now = Instant::now();
        match result {
            Ok(Ok(ws)) => {
                info!("[SHARD-{}] Connected to {}", shard_id, url);
                self.socket = Some(ws);
                self.shard.on_transport_open(now);
            }
            Ok(Err(e)) => self.shard.on_transport_failed(&e.to_string(), now),
            Err(_) => self.shard.on_transport_failed("Connection timeout", now),
        }
    }

    async fn write(&mut self, message: Message) {
        let Some(ws) = self.socket.as_mut() else {
            trace!("[SHARD-{}] No connection, dropping frame", self.shard.id());
            return;
        };
        match ws.send(message).await {
            Ok(()) => self.metrics.record_message_sent(),
            Err(e) => {
                warn!("[SHARD-{}] Failed to send message: {}", self.shard.id(), e);
                self.socket = None;
                self.shard
                    .on_transport_closed(ABNORMAL_CLOSURE, &e.to_string(), Instant::now());
            }
        }
    }
}

async fn next_frame(
    socket: &mut Option<WsStream>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match socket {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Type alias for WebSocket stream
type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// One attempt at opening a shard's transport
struct Dial<'a> {
    shard_id: u32,
    attempt: u32,
    /// Local address to bind, if any
    source_ip: Option<&'a str>,
}

impl Dial<'_> {
    fn fail(&self, message: impl std::fmt::Display) -> Error {
        Error::ConnectionFailed {
            attempts: self.attempt,
            last_error: message.to_string(),
        }
    }

    /// TCP connect, then TLS for `wss`, then the WebSocket upgrade
    async fn websocket(&self, url: &str) -> Result<WsStream, Error> {
        let parsed = Url::parse(url).map_err(|e| self.fail(format!("Invalid URL: {}", e)))?;
        let host = parsed.host_str().ok_or_else(|| self.fail("No host in URL"))?;
        let secure = parsed.scheme() == "wss";
        let port = parsed.port_or_known_default().unwrap_or(if secure { 443 } else { 80 });

        let mut request = url
            .into_client_request()
            .map_err(|e| self.fail(format!("Invalid WebSocket request: {}", e)))?;
        request.headers_mut().insert(
            USER_AGENT,
            HeaderValue::from_static(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"))),
        );

        let stream = self.tcp(host, port).await?;
        tune_socket(&stream);

        let connector = if secure {
            let tls = native_tls::TlsConnector::new().map_err(|e| self.fail(format!("TLS error: {}", e)))?;
            Some(Connector::NativeTls(tls))
        } else {
            None
        };

        let (ws, response) = client_async_tls_with_config(request, stream, None, connector).await?;
        trace!(
            "[SHARD-{}] Upgrade answered with {}",
            self.shard_id,
            response.status()
        );
        Ok(ws)
    }

    async fn tcp(&self, host: &str, port: u16) -> Result<tokio::net::TcpStream, Error> {
        let remote: SocketAddr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| self.fail(format!("DNS lookup for {} failed: {}", host, e)))?
            .next()
            .ok_or_else(|| self.fail(format!("No addresses found for {}", host)))?;

        let socket = match remote {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|e| self.fail(format!("Failed to create socket: {}", e)))?;

        if let Some(ip) = self.source_ip {
            let local: IpAddr = ip
                .parse()
                .map_err(|e| self.fail(format!("Invalid source IP '{}': {}", ip, e)))?;
            socket
                .bind(SocketAddr::new(local, 0))
                .map_err(|e| self.fail(format!("Failed to bind to {}: {}", ip, e)))?;
            debug!("[SHARD-{}] Bound outgoing connection to {}", self.shard_id, ip);
        }

        socket
            .connect(remote)
            .await
            .map_err(|e| self.fail(format!("TCP connect to {} failed: {}", remote, e)))
    }
}

/// Low latency for heartbeats, keepalive to notice dead peers between them
fn tune_socket(stream: &tokio::net::TcpStream) {
    let sock = socket2::SockRef::from(stream);
    let _ = sock.set_nodelay(true);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock.set_tcp_keepalive(&keepalive);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::codec::CodecConfig;
    use crate::config::ShardManagerConfig;
    use crate::events::EventSender;
    use crate::shard::ShardConfig;
    use tokio::net::TcpListener;

    fn runner(url: String) -> (ShardRunner<InMemoryCache>, ShardHandle, mpsc::UnboundedReceiver<(u32, ManagerSignal)>) {
        let config = ShardManagerConfig::builder()
            .token("Bot secret")
            .build()
            .unwrap();
        let metrics = Arc::new(Metrics::new());
        let (events, _rx) = EventSender::channel(16, metrics.clone());
        let codec = CodecConfig::negotiate(config.gateway.encoding, false);
        let shard = Shard::new(
            ShardConfig::new(&config, 0, 1, url, codec),
            Arc::new(InMemoryCache::new()),
            events,
            metrics.clone(),
        );
        let (tx, rx) = mpsc::channel(8);
        let (signals, signals_rx) = mpsc::unbounded_channel();
        let handle = ShardHandle::new(0, config.intents, tx, metrics.clone());
        (
            ShardRunner::new(shard, rx, signals, config.connection, metrics),
            handle,
            signals_rx,
        )
    }

    #[tokio::test]
    async fn test_dial_rejects_bad_url() {
        let dial = Dial {
            shard_id: 0,
            attempt: 1,
            source_ip: None,
        };
        let err = dial.websocket("not a url").await.unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_dial_reports_attempt_and_bad_source_ip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dial = Dial {
            shard_id: 3,
            attempt: 4,
            source_ip: Some("nope"),
        };
        let err = dial.tcp("127.0.0.1", port).await.unwrap_err();
        let Error::ConnectionFailed { attempts, last_error } = err else {
            panic!("unexpected error {:?}", err);
        };
        assert_eq!(attempts, 4);
        assert!(last_error.starts_with("Invalid source IP 'nope'"));
    }

    #[tokio::test]
    async fn test_dial_refused_names_remote() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let dial = Dial {
            shard_id: 0,
            attempt: 2,
            source_ip: None,
        };
        let err = dial.tcp("127.0.0.1", port).await.unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("Connection failed on attempt 2"));
        assert!(message.contains(&format!("127.0.0.1:{}", port)));
    }

    #[tokio::test]
    async fn test_failed_dial_releases_gate_and_schedules_retry() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (runner, handle, mut signals) = runner(format!("ws://127.0.0.1:{}/", port));
        let task = tokio::spawn(runner.run());

        handle.send(ShardCommand::Connect).await.unwrap();
        let (shard_id, signal) = signals.recv().await.unwrap();
        assert_eq!(shard_id, 0);
        assert_eq!(signal, ManagerSignal::NotReady);
        assert_eq!(signals.recv().await.unwrap().1, ManagerSignal::Released);

        handle.send(ShardCommand::Shutdown).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_fail_while_disconnected() {
        let (runner, handle, _signals) = runner("ws://127.0.0.1:1/".to_string());
        let task = tokio::spawn(runner.run());

        let result = handle.request_guild_members("1", MemberRequest::users(vec!["2".into()])).await;
        assert!(matches!(result, Err(Error::NotConnected(0))));
        // Stored for the next IDENTIFY even while offline
        handle.edit_status(Status::Idle, Vec::new()).await.unwrap();

        handle.send(ShardCommand::Shutdown).await.unwrap();
        task.await.unwrap();
        assert!(handle.disconnect(true).await.is_err());
    }
}
