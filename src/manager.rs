use crate::cache::{Cache, InMemoryCache};
use crate::codec::CodecConfig;
use crate::config::ShardManagerConfig;
use crate::connection::{ShardCommand, ShardHandle, ShardRunner};
use crate::error::Error;
use crate::events::{EventSender, ShardEvent};
use crate::metrics::Metrics;
use crate::rest::{gateway_url, GatewayResolver};
use crate::shard::{ManagerSignal, Shard, ShardConfig};
use futures_util::FutureExt;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Default channel buffer size
const DEFAULT_CHANNEL_SIZE: usize = 100;

/// Time between fresh identifies on the same concurrency key
const IDENTIFY_WINDOW: Duration = Duration::from_secs(5);

/// How long `stop()` waits for a shard task before aborting it
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type Signal = (u32, ManagerSignal);

/// Runs a set of gateway shards behind one identify gate.
///
/// # Thread Safety
///
/// `ShardManager` is `Send + Sync` and all methods can be safely called from
/// multiple tasks concurrently. Internal state is protected by `parking_lot::RwLock`
/// which does not poison on panic. Cross-shard decisions (the identify gate and
/// the all-ready latch) are made by a single coordinator task.
pub struct ShardManager<R: GatewayResolver, C: Cache = InMemoryCache> {
    config: ShardManagerConfig,
    resolver: R,
    cache: Arc<C>,
    metrics: Arc<Metrics>,
    events: EventSender,
    events_rx: parking_lot::Mutex<Option<mpsc::Receiver<ShardEvent>>>,
    state: Arc<RwLock<ManagerState>>,
    /// Shard task handles indexed by shard ID
    shard_handles: RwLock<HashMap<u32, JoinHandle<()>>>,
    coordinator: parking_lot::Mutex<Option<JoinHandle<()>>>,
    /// Serializes start/stop. A tokio Mutex so it can be held across await points.
    lifecycle_lock: Mutex<()>,
}

#[derive(Default)]
struct ManagerState {
    shards: HashMap<u32, ShardHandle>,
    total_shards: u32,
    url: String,
    codec: Option<CodecConfig>,
    signals: Option<mpsc::UnboundedSender<Signal>>,
    is_running: bool,
    all_ready: bool,
}

impl<R: GatewayResolver> ShardManager<R, InMemoryCache> {
    /// Create a manager backed by the in-memory cache
    pub fn new(config: ShardManagerConfig, resolver: R) -> Self {
        Self::with_cache(config, resolver, Arc::new(InMemoryCache::new()))
    }
}

impl<R: GatewayResolver, C: Cache> ShardManager<R, C> {
    /// Create a manager feeding dispatches into `cache`
    pub fn with_cache(config: ShardManagerConfig, resolver: R, cache: Arc<C>) -> Self {
        let metrics = Arc::new(Metrics::new());
        let (events, events_rx) = EventSender::channel(config.event_buffer, metrics.clone());
        Self {
            config,
            resolver,
            cache,
            metrics,
            events,
            events_rx: parking_lot::Mutex::new(Some(events_rx)),
            state: Arc::new(RwLock::new(ManagerState::default())),
            shard_handles: RwLock::new(HashMap::new()),
            coordinator: parking_lot::Mutex::new(None),
            lifecycle_lock: Mutex::new(()),
        }
    }

    /// Take the event receiver; only the first call gets it
    pub fn take_events(&self) -> Option<mpsc::Receiver<ShardEvent>> {
        self.events_rx.lock().take()
    }

    /// Get the metrics for this manager
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    /// Check if the manager is currently running
    pub fn is_running(&self) -> bool {
        self.state.read().is_running
    }

    /// Whether every spawned shard has become ready since the last start
    pub fn is_ready(&self) -> bool {
        self.state.read().all_ready
    }

    /// Total shard count across all processes, 0 before `start()`
    pub fn total_shards(&self) -> u32 {
        self.state.read().total_shards
    }

    /// Ids of the shards spawned in this process
    pub fn shard_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.state.read().shards.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Handle to a spawned shard
    pub fn shard(&self, shard_id: u32) -> Option<ShardHandle> {
        self.state.read().shards.get(&shard_id).cloned()
    }

    /// Shard responsible for a guild
    pub fn shard_for_guild(&self, guild_id: u64) -> Option<u32> {
        shard_for_guild(guild_id, self.total_shards())
    }

    /// Resolve the gateway, spawn the configured shards and queue them for connecting.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager is already running, the gateway cannot
    /// be resolved or the shard selection does not fit the shard count.
    pub async fn start(&self) -> Result<(), Error> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        if self.state.read().is_running {
            return Err(Error::AlreadyRunning);
        }

        let sharding = &self.config.sharding;
        let info = self
            .resolver
            .resolve_gateway(sharding.total_shards.is_none())
            .await?;
        let total = sharding.total_shards.or(info.shards).unwrap_or(1).max(1);
        let concurrency = sharding
            .concurrency
            .or(info.max_concurrency)
            .unwrap_or(1)
            .max(1);
        let codec = CodecConfig::negotiate(self.config.gateway.encoding, self.config.gateway.compress);
        let url = gateway_url(&info.url, self.config.gateway.version, codec)?;
        let ids = sharding.selection.ids(total)?;

        info!(
            "Starting ShardManager with {} of {} shards (concurrency {}) at {}",
            ids.len(),
            total,
            concurrency,
            url
        );

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.write();
            state.total_shards = total;
            state.url = url;
            state.codec = Some(codec);
            state.signals = Some(signals_tx);
            state.all_ready = false;
            state.is_running = true;
        }

        let coordinator = Coordinator {
            state: self.state.clone(),
            signals: signals_rx,
            queue: ConnectQueue::new(concurrency, IDENTIFY_WINDOW),
            ready: ReadyTracker::default(),
            events: self.events.clone(),
        };
        let previous = self.coordinator.lock().replace(tokio::spawn(coordinator.run()));
        if let Some(previous) = previous {
            previous.abort();
        }

        for id in ids {
            self.spawn(id)?;
            self.connect(id)?;
        }
        Ok(())
    }

    /// Create the shard task for `shard_id` unless it already exists
    pub fn spawn(&self, shard_id: u32) -> Result<ShardHandle, Error> {
        let mut state = self.state.write();
        if let Some(existing) = state.shards.get(&shard_id) {
            return Ok(existing.clone());
        }
        if !state.is_running {
            return Err(Error::ShuttingDown);
        }
        if shard_id >= state.total_shards {
            return Err(Error::UnknownShard(shard_id));
        }
        let (Some(signals), Some(codec)) = (state.signals.clone(), state.codec) else {
            return Err(Error::ShuttingDown);
        };

        debug!("[SHARD-{}] Spawning shard {}/{}", shard_id, shard_id, state.total_shards);
        let shard = Shard::new(
            ShardConfig::new(&self.config, shard_id, state.total_shards, state.url.clone(), codec),
            self.cache.clone(),
            self.events.clone(),
            self.metrics.clone(),
        );
        let (tx, rx) = mpsc::channel::<ShardCommand>(DEFAULT_CHANNEL_SIZE);
        let handle = ShardHandle::new(shard_id, self.config.intents, tx, self.metrics.clone());
        let runner = ShardRunner::new(
            shard,
            rx,
            signals,
            self.config.connection.clone(),
            self.metrics.clone(),
        );

        let metrics = self.metrics.clone();
        let task = tokio::spawn(run_shard_with_recovery(shard_id, runner, metrics));

        state.shards.insert(shard_id, handle.clone());
        self.shard_handles.write().insert(shard_id, task);
        Ok(handle)
    }

    /// Queue a shard for connecting through the identify gate
    pub fn connect(&self, shard_id: u32) -> Result<(), Error> {
        let state = self.state.read();
        if !state.shards.contains_key(&shard_id) {
            return Err(Error::UnknownShard(shard_id));
        }
        let signals = state.signals.as_ref().ok_or(Error::ShuttingDown)?;
        signals
            .send((shard_id, ManagerSignal::QueueConnect { resumable: false }))
            .map_err(|e| Error::ChannelSend(e.to_string()))
    }

    /// Stop all shards
    ///
    /// Every shard is hard-reset and its task ends. After stopping, the
    /// manager can be restarted with `start()` and will signal all-ready again.
    pub async fn stop(&self) -> Result<(), Error> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        info!("Stopping ShardManager");

        let shards: Vec<ShardHandle> = {
            let mut state = self.state.write();
            state.is_running = false;
            state.all_ready = false;
            state.signals = None;
            state.shards.drain().map(|(_, handle)| handle).collect()
        };

        for shard in shards {
            if let Err(e) = shard.send(ShardCommand::Shutdown).await {
                debug!("[SHARD-{}] Failed to send shutdown: {}", shard.id(), e);
            }
        }

        let handles: HashMap<u32, JoinHandle<()>> = std::mem::take(&mut *self.shard_handles.write());
        for (shard_id, mut handle) in handles {
            if timeout(SHUTDOWN_TIMEOUT, &mut handle).await.is_err() {
                warn!("[SHARD-{}] Shard task did not stop in time, aborting", shard_id);
                handle.abort();
            }
            self.metrics.remove_shard(shard_id);
        }

        if let Some(coordinator) = self.coordinator.lock().take() {
            coordinator.abort();
        }

        info!("ShardManager stopped");
        Ok(())
    }
}

impl<R: GatewayResolver, C: Cache> Drop for ShardManager<R, C> {
    fn drop(&mut self) {
        // Abort all tasks to prevent orphans
        let handles = std::mem::take(&mut *self.shard_handles.write());
        for (_shard_id, handle) in handles {
            handle.abort();
        }
        if let Some(coordinator) = self.coordinator.lock().take() {
            coordinator.abort();
        }
    }
}

/// Shard owning a guild: `(guild_id >> 22) % total`
pub fn shard_for_guild(guild_id: u64, total_shards: u32) -> Option<u32> {
    if total_shards == 0 {
        return None;
    }
    Some(((guild_id >> 22) % u64::from(total_shards)) as u32)
}

async fn run_shard_with_recovery<C: Cache>(shard_id: u32, runner: ShardRunner<C>, metrics: Arc<Metrics>) {
    match AssertUnwindSafe(runner.run()).catch_unwind().await {
        Ok(()) => {
            debug!("[SHARD-{}] Shard task completed normally", shard_id);
        }
        Err(panic_err) => {
            let panic_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_err.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            error!(
                "[SHARD-{}] Shard task PANICKED: {}. Shard is now dead.",
                shard_id, panic_msg
            );
            metrics.record_error();
        }
    }
}

/// Task making every cross-shard decision
struct Coordinator {
    state: Arc<RwLock<ManagerState>>,
    signals: mpsc::UnboundedReceiver<Signal>,
    queue: ConnectQueue,
    ready: ReadyTracker,
    events: EventSender,
}

impl Coordinator {
    async fn run(mut self) {
        loop {
            for shard_id in self.queue.poll(Instant::now()) {
                self.dispatch_connect(shard_id).await;
            }

            let deadline = self.queue.next_deadline();
            let signal = tokio::select! {
                signal = self.signals.recv() => signal,
                _ = sleep_until(deadline) => continue,
            };
            let Some((shard_id, signal)) = signal else {
                debug!("All shards gone, coordinator exiting");
                break;
            };

            trace!("[SHARD-{}] Manager signal {:?}", shard_id, signal);
            match signal {
                ManagerSignal::QueueConnect { resumable } => self.queue.push(shard_id, resumable),
                ManagerSignal::Released => self.queue.release(shard_id, Instant::now()),
                ManagerSignal::Ready => self.on_ready(shard_id),
                ManagerSignal::NotReady => self.ready.not_ready(shard_id),
            }
        }
    }

    async fn dispatch_connect(&mut self, shard_id: u32) {
        let handle = self.state.read().shards.get(&shard_id).cloned();
        let sent = match handle {
            Some(handle) => handle.send(ShardCommand::Connect).await,
            None => Err(Error::UnknownShard(shard_id)),
        };
        if let Err(e) = sent {
            debug!("[SHARD-{}] Dropping connect: {}", shard_id, e);
            self.queue.release(shard_id, Instant::now());
        }
    }

    fn on_ready(&mut self, shard_id: u32) {
        let fire = {
            let mut state = self.state.write();
            let fire = self.ready.ready(shard_id, state.shards.keys());
            if fire {
                state.all_ready = true;
            }
            fire
        };
        if fire {
            info!("All {} shards ready", self.ready.len());
            self.events.emit(ShardEvent::AllReady);
        }
    }
}

/// Identify gate: one handshake in flight per `shard_id % concurrency` key,
/// with fresh identifies on a key spaced by the identify window
#[derive(Debug)]
struct ConnectQueue {
    concurrency: u32,
    window: Duration,
    queue: VecDeque<(u32, bool)>,
    in_flight: HashMap<u32, u32>,
    last_release: HashMap<u32, Instant>,
}

impl ConnectQueue {
    fn new(concurrency: u32, window: Duration) -> Self {
        Self {
            concurrency: concurrency.max(1),
            window,
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            last_release: HashMap::new(),
        }
    }

    fn key(&self, shard_id: u32) -> u32 {
        shard_id % self.concurrency
    }

    fn push(&mut self, shard_id: u32, resumable: bool) {
        if let Some(entry) = self.queue.iter_mut().find(|(id, _)| *id == shard_id) {
            entry.1 |= resumable;
            return;
        }
        self.queue.push_back((shard_id, resumable));
    }

    fn release(&mut self, shard_id: u32, now: Instant) {
        let key = self.key(shard_id);
        if self.in_flight.get(&key) == Some(&shard_id) {
            self.in_flight.remove(&key);
            self.last_release.insert(key, now);
        }
    }

    fn allowed_at(&self, shard_id: u32, resumable: bool) -> Option<Instant> {
        if resumable {
            return None;
        }
        self.last_release
            .get(&self.key(shard_id))
            .map(|at| *at + self.window)
    }

    /// Shards that may start their handshake now, oldest first
    fn poll(&mut self, now: Instant) -> Vec<u32> {
        let mut released = Vec::new();
        let mut waiting = VecDeque::with_capacity(self.queue.len());
        while let Some((shard_id, resumable)) = self.queue.pop_front() {
            let key = self.key(shard_id);
            let open = !self.in_flight.contains_key(&key)
                && self.allowed_at(shard_id, resumable).map_or(true, |at| at <= now);
            if open {
                self.in_flight.insert(key, shard_id);
                released.push(shard_id);
            } else {
                waiting.push_back((shard_id, resumable));
            }
        }
        self.queue = waiting;
        released
    }

    /// When a queued shard next becomes eligible; `None` while waiting on a release
    fn next_deadline(&self) -> Option<Instant> {
        self.queue
            .iter()
            .filter(|(id, _)| !self.in_flight.contains_key(&self.key(*id)))
            .filter_map(|(id, resumable)| self.allowed_at(*id, *resumable))
            .min()
    }
}

/// Latch firing once when every spawned shard is ready
#[derive(Debug, Default)]
struct ReadyTracker {
    ready: HashSet<u32>,
    fired: bool,
}

impl ReadyTracker {
    /// Record a ready shard; true exactly once, when all of `spawned` are ready
    fn ready<'a>(&mut self, shard_id: u32, mut spawned: impl Iterator<Item = &'a u32>) -> bool {
        self.ready.insert(shard_id);
        if self.fired {
            return false;
        }
        let mut any = false;
        let all = spawned.all(|id| {
            any = true;
            self.ready.contains(id)
        });
        self.fired = any && all;
        self.fired
    }

    fn not_ready(&mut self, shard_id: u32) {
        self.ready.remove(&shard_id);
    }

    fn len(&self) -> usize {
        self.ready.len()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::StaticGateway;

    fn config() -> ShardManagerConfig {
        ShardManagerConfig::builder().token("Bot abc").build().unwrap()
    }

    #[test]
    fn test_shard_for_guild() {
        let guild_id: u64 = 175928847299117063;
        assert_eq!(shard_for_guild(guild_id, 1), Some(0));
        assert_eq!(shard_for_guild(guild_id, 16), Some(((guild_id >> 22) % 16) as u32));
        assert_eq!(shard_for_guild(guild_id, 0), None);
    }

    #[test]
    fn test_connect_queue_one_in_flight_per_key() {
        let now = Instant::now();
        let mut queue = ConnectQueue::new(2, IDENTIFY_WINDOW);
        for id in 0..4 {
            queue.push(id, false);
        }

        assert_eq!(queue.poll(now), vec![0, 1]);
        assert!(queue.poll(now).is_empty());
        assert_eq!(queue.next_deadline(), None);

        queue.release(0, now);
        assert!(queue.poll(now).is_empty());
        assert_eq!(queue.next_deadline(), Some(now + IDENTIFY_WINDOW));
        assert_eq!(queue.poll(now + IDENTIFY_WINDOW), vec![2]);
    }

    #[test]
    fn test_connect_queue_resume_skips_window() {
        let now = Instant::now();
        let mut queue = ConnectQueue::new(1, IDENTIFY_WINDOW);
        queue.push(0, false);
        assert_eq!(queue.poll(now), vec![0]);
        queue.release(0, now);

        queue.push(3, true);
        queue.push(4, false);
        assert_eq!(queue.poll(now), vec![3]);
        queue.release(3, now);
        assert_eq!(queue.poll(now + Duration::from_secs(1)), Vec::<u32>::new());
        assert_eq!(queue.poll(now + IDENTIFY_WINDOW), vec![4]);
    }

    #[test]
    fn test_connect_queue_dedupes_and_ignores_stray_release() {
        let now = Instant::now();
        let mut queue = ConnectQueue::new(1, IDENTIFY_WINDOW);
        queue.push(0, false);
        queue.push(0, true);
        queue.release(5, now);
        assert_eq!(queue.poll(now), vec![0]);
        assert!(queue.queue.is_empty());
    }

    #[test]
    fn test_ready_tracker_fires_once() {
        let spawned: HashSet<u32> = [0, 1].into_iter().collect();
        let mut tracker = ReadyTracker::default();
        assert!(!tracker.ready(0, spawned.iter()));
        assert!(tracker.ready(1, spawned.iter()));

        tracker.not_ready(1);
        assert!(!tracker.ready(1, spawned.iter()));
    }

    #[test]
    fn test_ready_tracker_needs_shards() {
        let mut tracker = ReadyTracker::default();
        assert!(!tracker.ready(0, std::iter::empty()));
    }

    #[tokio::test]
    async fn test_start_rejects_out_of_range_selection() {
        let mut config = config();
        config.sharding.total_shards = Some(2);
        config.sharding.selection = crate::config::ShardSelection::List(vec![5]);
        let manager = ShardManager::new(config, StaticGateway::new("ws://127.0.0.1:1"));

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        manager.stop().await.unwrap();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_start_spawns_selected_shards() {
        let mut config = config();
        config.sharding.selection = crate::config::ShardSelection::Range { first: 1, last: 2 };
        config.connection.auto_reconnect = false;
        let resolver = StaticGateway::new("ws://127.0.0.1:1").with_shards(4);
        let manager = ShardManager::new(config, resolver);

        manager.start().await.unwrap();
        assert!(manager.is_running());
        assert_eq!(manager.total_shards(), 4);
        assert_eq!(manager.shard_ids(), vec![1, 2]);
        assert!(matches!(manager.start().await, Err(Error::AlreadyRunning)));
        assert!(matches!(manager.spawn(4), Err(Error::UnknownShard(4))));
        assert_eq!(manager.spawn(1).unwrap().id(), 1);

        manager.stop().await.unwrap();
        assert!(manager.shard_ids().is_empty());
        assert!(manager.shard(1).is_none());
        assert!(manager.take_events().is_some());
        assert!(manager.take_events().is_none());
    }
}
