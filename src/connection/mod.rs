//! High-availability connection manager for the backing store.
//!
//! Resolves the current primary (statically or through sentinels), hands out
//! a shared multiplexed connection, and reconnects in the background when the
//! connection breaks or the node gets demoted. While no connection is
//! installed every operation fails fast with [`CacheError::Unavailable`].

pub mod config;
pub mod health;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use redis::aio::MultiplexedConnection;
use redis::{ConnectionAddr, ConnectionInfo, ErrorKind, RedisConnectionInfo, RedisError};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};

use crate::error::CacheError;
use crate::events::{CacheEvent, ConnectionState, EventSink};
use crate::utils::now_ms;

pub use config::{ConnectionConfig, Endpoint, RetryPolicy};
pub use health::{ConnectionHealth, HealthReport, NodeInfo, NodeRole};

use config::parse_host_port;

/// Timeouts in a row after which the connection is treated as lost.
const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// How a failed command should affect the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    /// The node was demoted; re-resolve the primary right away.
    Demoted,
    /// The transport is gone; reconnect with backoff.
    Connection,
    /// A command-level error; the connection is fine.
    Command,
}

fn classify(err: &RedisError) -> ErrorClass {
    match err.kind() {
        ErrorKind::ReadOnly | ErrorKind::MasterDown => ErrorClass::Demoted,
        _ if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout() =>
        {
            ErrorClass::Connection
        }
        _ => ErrorClass::Command,
    }
}

struct State {
    conn: Option<MultiplexedConnection>,
    /// Bumped on every install so errors from a replaced connection can be
    /// told apart from errors on the current one.
    generation: u64,
    primary: Option<String>,
    health: ConnectionHealth,
}

/// Shared, self-healing handle to the backing store.
pub struct ConnectionManager {
    config: ConnectionConfig,
    events: Arc<dyn EventSink>,
    state: RwLock<State>,
    reconnecting: AtomicBool,
    closed: AtomicBool,
}

impl ConnectionManager {
    fn new(config: ConnectionConfig, events: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(ConnectionManager {
            config,
            events,
            state: RwLock::new(State {
                conn: None,
                generation: 0,
                primary: None,
                health: ConnectionHealth::default(),
            }),
            reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Resolve the primary and connect to it.
    ///
    /// Fails if the first connection attempt fails; see
    /// [`ConnectionManager::connect_lazy`] for a non-failing variant.
    pub async fn connect(
        config: ConnectionConfig,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>, CacheError> {
        let manager = Self::new(config, events);
        let (conn, address) = manager.establish().await?;
        manager.install(conn, address);
        Ok(manager)
    }

    /// Return immediately and connect in the background.
    ///
    /// Operations fail fast with `Unavailable` until the first connection
    /// succeeds, so the cache behaves as "always miss" during startup.
    pub fn connect_lazy(config: ConnectionConfig, events: Arc<dyn EventSink>) -> Arc<Self> {
        let manager = Self::new(config, events);
        manager.ensure_reconnecting(true);
        manager
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Whether a connection is currently installed.
    pub fn is_connected(&self) -> bool {
        self.state.read().conn.is_some()
    }

    /// Address of the node currently treated as primary.
    pub fn primary(&self) -> Option<String> {
        self.state.read().primary.clone()
    }

    /// Snapshot of the active node's health record.
    pub fn health(&self) -> ConnectionHealth {
        self.state.read().health.clone()
    }

    /// Drop the connection and stop reconnecting.
    ///
    /// Every later operation fails with `Unavailable`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let generation = self.state.read().generation;
        self.disconnect(generation, "connection closed");
    }

    /// Run one backing-store command with the configured timeout and
    /// failover handling.
    pub async fn run<T, F, Fut>(
        self: &Arc<Self>,
        op: &'static str,
        key: &str,
        f: F,
    ) -> Result<T, CacheError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        let (conn, generation) = self.connection()?;

        match timeout(self.config.command_timeout, f(conn)).await {
            Ok(Ok(value)) => {
                let state = self.state.upgradable_read();
                if state.generation == generation && state.health.consecutive_failures != 0 {
                    RwLockUpgradableReadGuard::upgrade(state).health.consecutive_failures = 0;
                }
                Ok(value)
            }
            Ok(Err(err)) => Err(self.handle_error(op, key, err, generation)),
            Err(_) => {
                let failures = self.record_failure(generation);
                if failures >= MAX_CONSECUTIVE_TIMEOUTS
                    && self.disconnect(generation, "repeated command timeouts")
                {
                    self.ensure_reconnecting(false);
                }
                Err(CacheError::Timeout {
                    op,
                    key: key.to_string(),
                })
            }
        }
    }

    /// Ping the active node and read its metadata.
    pub async fn check_health(self: &Arc<Self>) -> HealthReport {
        let (conn, generation) = match self.connection() {
            Ok(found) => found,
            Err(e) => {
                self.state.write().health.last_checked_at = Some(now_ms());
                return HealthReport::unhealthy(e.to_string());
            }
        };

        let check = async move {
            let mut conn = conn;
            let start = Instant::now();
            redis::cmd("PING").query_async::<String>(&mut conn).await?;
            let latency_ms = start.elapsed().as_millis() as u64;
            let info = redis::cmd("INFO").query_async::<String>(&mut conn).await?;
            Ok::<_, RedisError>((latency_ms, NodeInfo::parse(&info)))
        };

        let report = match timeout(self.config.command_timeout, check).await {
            Ok(Ok((latency_ms, node))) => {
                let mut state = self.state.write();
                state.health.role = node.role;
                state.health.last_latency_ms = Some(latency_ms);
                state.health.consecutive_failures = 0;
                HealthReport {
                    healthy: true,
                    latency_ms: Some(latency_ms),
                    node: Some(node),
                    error: None,
                }
            }
            Ok(Err(err)) => {
                HealthReport::unhealthy(self.handle_error("HEALTH", "", err, generation).to_string())
            }
            Err(_) => {
                self.record_failure(generation);
                HealthReport::unhealthy("health check timed out")
            }
        };

        self.state.write().health.last_checked_at = Some(now_ms());
        report
    }

    /// Run [`ConnectionManager::check_health`] every `health_check_interval`.
    ///
    /// Emits [`CacheEvent::HealthChanged`] for the first report and for every
    /// healthy/unhealthy flip after it. The loop ends once the manager is
    /// dropped or closed.
    pub fn spawn_health_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.health_check_interval;

        tokio::spawn(async move {
            tracing::info!(
                interval_secs = period.as_secs(),
                "starting backing store health monitor"
            );
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut was_healthy: Option<bool> = None;

            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else {
                    break;
                };
                if this.closed.load(Ordering::Acquire) {
                    break;
                }

                let report = this.check_health().await;
                if was_healthy != Some(report.healthy) {
                    was_healthy = Some(report.healthy);
                    this.events.emit(CacheEvent::HealthChanged {
                        healthy: report.healthy,
                        latency_ms: report.latency_ms,
                        error: report.error,
                    });
                } else {
                    tracing::debug!(
                        healthy = report.healthy,
                        latency_ms = report.latency_ms,
                        "backing store health check"
                    );
                }
            }
        })
    }

    /// The installed connection and the generation it belongs to.
    fn connection(self: &Arc<Self>) -> Result<(MultiplexedConnection, u64), CacheError> {
        {
            let state = self.state.read();
            if let Some(conn) = state.conn.clone() {
                return Ok((conn, state.generation));
            }
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Unavailable("connection closed".to_string()));
        }
        self.ensure_reconnecting(false);
        Err(CacheError::Unavailable(
            "no connection to the primary, reconnecting".to_string(),
        ))
    }

    /// Classify a failed command. Only errors from the current generation
    /// may tear the connection down; a late error from a connection that
    /// failover already replaced is just returned.
    fn handle_error(
        self: &Arc<Self>,
        op: &'static str,
        key: &str,
        err: RedisError,
        generation: u64,
    ) -> CacheError {
        self.record_failure(generation);

        match classify(&err) {
            ErrorClass::Demoted => {
                tracing::warn!(op, error = %err, "node is no longer primary, re-resolving");
                if self.disconnect(generation, "node demoted") {
                    self.ensure_reconnecting(true);
                }
                CacheError::ReadOnly(err.to_string())
            }
            ErrorClass::Connection => {
                if self.disconnect(generation, "connection lost") {
                    self.ensure_reconnecting(false);
                }
                CacheError::Unavailable(err.to_string())
            }
            ErrorClass::Command => CacheError::operation("redis", key, format!("{} failed: {}", op, err)),
        }
    }

    /// Count a failure against `generation`; returns the running count, or
    /// zero when that connection is no longer installed.
    fn record_failure(&self, generation: u64) -> u32 {
        let mut state = self.state.write();
        if state.generation != generation {
            return 0;
        }
        state.health.consecutive_failures += 1;
        state.health.consecutive_failures
    }

    /// Drop the connection if it still belongs to `generation`.
    fn disconnect(&self, generation: u64, reason: &str) -> bool {
        let dropped = {
            let mut state = self.state.write();
            state.generation == generation && state.conn.take().is_some()
        };
        if dropped {
            tracing::warn!(reason, generation, "backing store connection dropped");
            self.events.emit(CacheEvent::ConnectionStateChanged {
                from: ConnectionState::Connected,
                to: ConnectionState::Disconnected,
            });
        }
        dropped
    }

    fn install(&self, conn: MultiplexedConnection, address: String) {
        let previous = {
            let mut state = self.state.write();
            let previous = state.primary.replace(address.clone());
            state.conn = Some(conn);
            state.generation += 1;
            state.health = ConnectionHealth {
                address: Some(address.clone()),
                role: NodeRole::Primary,
                last_latency_ms: None,
                consecutive_failures: 0,
                last_checked_at: Some(now_ms()),
            };
            previous
        };

        tracing::info!(primary = %address, "connected to backing store");
        self.events.emit(CacheEvent::ConnectionStateChanged {
            from: ConnectionState::Disconnected,
            to: ConnectionState::Connected,
        });
        if previous.as_deref() != Some(address.as_str()) {
            self.events.emit(CacheEvent::PrimaryChanged {
                previous,
                current: address,
            });
        }
    }

    /// Start the reconnect loop unless one is already running.
    ///
    /// With `immediate` the first attempt happens without waiting.
    fn ensure_reconnecting(self: &Arc<Self>, immediate: bool) {
        if self.closed.load(Ordering::Acquire) || self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }

        let weak = Arc::downgrade(self);
        let retry = self.config.retry.clone();

        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            if !immediate {
                tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                attempt += 1;
            }

            loop {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                if this.closed.load(Ordering::Acquire) {
                    this.reconnecting.store(false, Ordering::Release);
                    return;
                }

                match this.establish().await {
                    Ok((conn, address)) => {
                        if !this.closed.load(Ordering::Acquire) {
                            this.install(conn, address);
                        }
                        this.reconnecting.store(false, Ordering::Release);
                        return;
                    }
                    Err(e) => {
                        let delay = retry.delay_for_attempt(attempt);
                        tracing::warn!(
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "reconnect to backing store failed"
                        );
                        drop(this);
                        tokio::time::sleep(delay).await;
                        attempt = attempt.saturating_add(1);
                    }
                }
            }
        });
    }

    /// Resolve the primary and open a connection to it.
    async fn establish(&self) -> Result<(MultiplexedConnection, String), CacheError> {
        match &self.config.endpoint {
            Endpoint::Static { addr } => {
                let conn = self.open(addr.clone(), true).await?;
                Ok((conn, addr.to_string()))
            }
            Endpoint::Sentinel { nodes, master_name } => {
                let mut last_error = None;
                for node in nodes {
                    match self.resolve_primary(node, master_name).await {
                        Ok(found) => return Ok(found),
                        Err(e) => {
                            tracing::debug!(sentinel = %node, error = %e, "sentinel resolution failed");
                            last_error = Some(e);
                        }
                    }
                }
                Err(last_error.unwrap_or_else(|| {
                    CacheError::Unavailable("no sentinel endpoints configured".to_string())
                }))
            }
        }
    }

    /// Ask one sentinel for the primary, connect, and confirm its role.
    async fn resolve_primary(
        &self,
        sentinel: &str,
        master_name: &str,
    ) -> Result<(MultiplexedConnection, String), CacheError> {
        let (host, port) = parse_host_port(sentinel, 26379).ok_or_else(|| {
            CacheError::Unavailable(format!("invalid sentinel address '{}'", sentinel))
        })?;
        let mut sentinel_conn = self.open(ConnectionAddr::Tcp(host, port), false).await?;

        let addr = timeout(
            self.config.command_timeout,
            redis::cmd("SENTINEL")
                .arg("get-master-addr-by-name")
                .arg(master_name)
                .query_async::<Option<(String, String)>>(&mut sentinel_conn),
        )
        .await
        .map_err(|_| CacheError::Timeout {
            op: "SENTINEL",
            key: master_name.to_string(),
        })?
        .map_err(|e| CacheError::Unavailable(format!("sentinel {} query failed: {}", sentinel, e)))?;

        let Some((primary_host, primary_port)) = addr else {
            return Err(CacheError::Unavailable(format!(
                "sentinel {} does not know master '{}'",
                sentinel, master_name
            )));
        };
        let primary_port: u16 = primary_port.parse().map_err(|_| {
            CacheError::Unavailable(format!("sentinel returned invalid port '{}'", primary_port))
        })?;

        let mut conn = self
            .open(ConnectionAddr::Tcp(primary_host.clone(), primary_port), true)
            .await?;
        let info = timeout(
            self.config.command_timeout,
            redis::cmd("INFO")
                .arg("replication")
                .query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| CacheError::Timeout {
            op: "INFO",
            key: master_name.to_string(),
        })?
        .map_err(|e| CacheError::Unavailable(format!("role check failed: {}", e)))?;

        let address = format!("{}:{}", primary_host, primary_port);
        match NodeInfo::parse(&info).role {
            NodeRole::Primary => Ok((conn, address)),
            role => Err(CacheError::Unavailable(format!(
                "{} reported role {:?}, failover still in progress",
                address, role
            ))),
        }
    }

    async fn open(
        &self,
        addr: ConnectionAddr,
        data_node: bool,
    ) -> Result<MultiplexedConnection, CacheError> {
        let target = addr.to_string();
        let redis = if data_node {
            RedisConnectionInfo {
                db: self.config.database,
                username: self.config.username.clone(),
                password: self.config.password.clone(),
                ..Default::default()
            }
        } else {
            RedisConnectionInfo::default()
        };
        let info = ConnectionInfo { addr, redis };

        let client = redis::Client::open(info).map_err(|e| {
            CacheError::Unavailable(format!("Failed to create Redis client: {}", e))
        })?;

        timeout(
            self.config.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| CacheError::Timeout {
            op: "CONNECT",
            key: target.clone(),
        })?
        .map_err(|e| CacheError::Unavailable(format!("Failed to connect to {}: {}", target, e)))
    }
}
