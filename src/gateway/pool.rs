// =============================================================================
// GatewayPool — per-connection LRU cache of live exchange gateways
// =============================================================================
//
// Every entry is decrypted and constructed lazily, on first checkout. Idle
// entries are swept on a timer; unhealthy entries are refused to callers
// until a `cool_down` period elapses. The pool holds its own lock per entry
// map mutation but never across an exchange or store I/O call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::crypto::KeyManager;
use crate::domain::connection::ExchangeType;
use crate::error::EngineError;
use crate::persistence::Store;

use super::{binance::BinanceGateway, mock::MockGateway, Gateway};

pub const DEFAULT_MAX_SIZE: usize = 64;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_COOL_DOWN: Duration = Duration::from_secs(60);

enum CacheLookup {
    Healthy(Arc<dyn Gateway>),
    Unhealthy,
    Absent,
}

struct PoolEntry {
    gateway: Arc<dyn Gateway>,
    created_at: Instant,
    last_used: Instant,
    last_healthy_at: Instant,
    failures: u32,
    unhealthy_until: Option<Instant>,
}

pub struct GatewayPoolConfig {
    pub max_size: usize,
    pub idle_timeout: Duration,
    pub health_interval: Duration,
    pub failure_threshold: u32,
    pub cool_down: Duration,
    /// Parameters for `MockGateway` instances this pool constructs — only
    /// meaningful for connections whose `exchange_type` is `Mock`.
    pub dry_run_slippage_bps: f64,
    pub dry_run_fee_rate: f64,
    pub dry_run_latency_min_ms: u64,
    pub dry_run_latency_max_ms: u64,
}

impl Default for GatewayPoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cool_down: DEFAULT_COOL_DOWN,
            dry_run_slippage_bps: 0.0,
            dry_run_fee_rate: 0.0,
            dry_run_latency_min_ms: 0,
            dry_run_latency_max_ms: 0,
        }
    }
}

pub struct GatewayPool {
    entries: RwLock<HashMap<String, PoolEntry>>,
    store: Arc<dyn Store>,
    keys: Arc<KeyManager>,
    config: GatewayPoolConfig,
    cancel: CancellationToken,
}

impl GatewayPool {
    pub fn new(store: Arc<dyn Store>, keys: Arc<KeyManager>, config: GatewayPoolConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            store,
            keys,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Resolve the live gateway for `(user_id, connection_id)`, constructing
    /// and caching it on first use.
    pub async fn get_or_create(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<Arc<dyn Gateway>, EngineError> {
        match self.try_cached(connection_id) {
            CacheLookup::Healthy(gateway) => return Ok(gateway),
            CacheLookup::Unhealthy => {
                return Err(EngineError::GatewayUnhealthy {
                    connection_id: connection_id.to_string(),
                })
            }
            CacheLookup::Absent => {}
        }

        let connection = self
            .store
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| EngineError::ConnectionNotFound {
                user_id: user_id.to_string(),
                connection_id: connection_id.to_string(),
            })?;

        if !connection.is_usable_by(user_id) {
            return Err(EngineError::OwnershipDenied {
                user_id: user_id.to_string(),
                connection_id: connection_id.to_string(),
            });
        }

        let api_key = self
            .keys
            .decrypt(&connection.encrypted_api_key, connection.key_version)?;
        let api_secret = self
            .keys
            .decrypt(&connection.encrypted_api_secret, connection.key_version)?;

        let gateway: Arc<dyn Gateway> = match connection.exchange_type {
            ExchangeType::Binance => Arc::new(BinanceGateway::new(&api_key, &api_secret)),
            ExchangeType::Mock => Arc::new(MockGateway::new(
                self.config.dry_run_slippage_bps,
                self.config.dry_run_fee_rate,
                self.config.dry_run_latency_min_ms,
                self.config.dry_run_latency_max_ms,
            )),
        };

        self.insert(connection_id.to_string(), gateway.clone());
        Ok(gateway)
    }

    /// Looks up an existing pool entry, distinguishing "not cached yet"
    /// from "cached but still in its cooldown window" — the two must never
    /// be conflated, or a cooldown'd entry gets silently replaced by a
    /// freshly-healthy one on the very next call.
    fn try_cached(&self, connection_id: &str) -> CacheLookup {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(connection_id) else {
            return CacheLookup::Absent;
        };

        if let Some(until) = entry.unhealthy_until {
            if Instant::now() < until {
                return CacheLookup::Unhealthy;
            }
        }

        entry.last_used = Instant::now();
        CacheLookup::Healthy(entry.gateway.clone())
    }

    fn insert(&self, connection_id: String, gateway: Arc<dyn Gateway>) {
        let mut entries = self.entries.write();

        if entries.len() >= self.config.max_size && !entries.contains_key(&connection_id) {
            if let Some(lru_key) = entries
                .iter()
                .filter(|(_, e)| e.unhealthy_until.is_none())
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&lru_key);
                info!(connection_id = lru_key, "evicted LRU gateway pool entry");
            }
        }

        let now = Instant::now();
        entries.insert(
            connection_id,
            PoolEntry {
                gateway,
                created_at: now,
                last_used: now,
                last_healthy_at: now,
                failures: 0,
                unhealthy_until: None,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the idle-sweep and health-check background loops.
    pub fn start(self: &Arc<Self>) {
        let idle_self = self.clone();
        tokio::spawn(async move {
            idle_self.run_idle_sweep().await;
        });

        let health_self = self.clone();
        tokio::spawn(async move {
            health_self.run_health_check().await;
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        self.entries.write().clear();
    }

    async fn run_idle_sweep(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => {
                    let now = Instant::now();
                    let mut entries = self.entries.write();
                    let before = entries.len();
                    entries.retain(|_, e| now.duration_since(e.last_used) < self.config.idle_timeout);
                    let evicted = before - entries.len();
                    if evicted > 0 {
                        info!(evicted, "idle-swept gateway pool entries");
                    }
                }
            }
        }
    }

    async fn run_health_check(&self) {
        let mut interval = tokio::time::interval(self.config.health_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => {
                    let snapshot: Vec<(String, Arc<dyn Gateway>)> = self
                        .entries
                        .read()
                        .iter()
                        .map(|(k, e)| (k.clone(), e.gateway.clone()))
                        .collect();

                    for (connection_id, gateway) in snapshot {
                        let ok = gateway.ping().await.is_ok();
                        let mut entries = self.entries.write();
                        if let Some(entry) = entries.get_mut(&connection_id) {
                            if ok {
                                entry.failures = 0;
                                entry.last_healthy_at = Instant::now();
                                entry.unhealthy_until = None;
                            } else {
                                entry.failures += 1;
                                warn!(connection_id, failures = entry.failures, "gateway health check failed");
                                if entry.failures >= self.config.failure_threshold {
                                    entry.unhealthy_until = Some(Instant::now() + self.config.cool_down);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::connection::Connection;
    use crate::persistence::memory::MemoryStore;
    use chrono::Utc;

    fn key_manager() -> Arc<KeyManager> {
        Arc::new(KeyManager::new(1, &vec![3u8; 32]).unwrap())
    }

    async fn seed_connection(store: &Arc<dyn Store>, keys: &KeyManager, id: &str, user_id: &str) {
        let conn = Connection {
            id: id.into(),
            user_id: user_id.into(),
            exchange_type: ExchangeType::Mock,
            encrypted_api_key: keys.encrypt("key").unwrap(),
            encrypted_api_secret: keys.encrypt("secret").unwrap(),
            key_version: 1,
            active: true,
            name: "test".into(),
            created_at: Utc::now(),
        };
        store.put_connection(conn).await.unwrap();
    }

    #[tokio::test]
    async fn get_or_create_constructs_and_caches_gateway() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let keys = key_manager();
        seed_connection(&store, &keys, "conn-1", "user-1").await;

        let pool = GatewayPool::new(store, keys, GatewayPoolConfig::default());
        assert_eq!(pool.len(), 0);
        pool.get_or_create("user-1", "conn-1").await.unwrap();
        assert_eq!(pool.len(), 1);
        pool.get_or_create("user-1", "conn-1").await.unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn ownership_mismatch_is_rejected() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let keys = key_manager();
        seed_connection(&store, &keys, "conn-1", "user-1").await;

        let pool = GatewayPool::new(store, keys, GatewayPoolConfig::default());
        let err = pool.get_or_create("user-2", "conn-1").await.unwrap_err();
        assert_eq!(err.code(), "OWNERSHIP_DENIED");
    }

    #[tokio::test]
    async fn unknown_connection_is_not_found() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let keys = key_manager();
        let pool = GatewayPool::new(store, keys, GatewayPoolConfig::default());
        let err = pool.get_or_create("user-1", "missing").await.unwrap_err();
        assert_eq!(err.code(), "CONNECTION_NOT_FOUND");
    }

    #[tokio::test]
    async fn cached_entry_in_cooldown_is_refused_not_replaced() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let keys = key_manager();
        seed_connection(&store, &keys, "conn-1", "user-1").await;

        let pool = GatewayPool::new(store, keys, GatewayPoolConfig::default());
        pool.get_or_create("user-1", "conn-1").await.unwrap();

        // Trip the circuit breaker by hand, as `run_health_check` would.
        {
            let mut entries = pool.entries.write();
            let entry = entries.get_mut("conn-1").unwrap();
            entry.failures = 5;
            entry.unhealthy_until = Some(Instant::now() + Duration::from_secs(60));
        }

        let err = pool.get_or_create("user-1", "conn-1").await.unwrap_err();
        assert_eq!(err.code(), "GATEWAY_UNHEALTHY");

        // The cooldown must still be in effect — a fresh healthy entry must
        // not have silently replaced it.
        let entries = pool.entries.read();
        let entry = entries.get("conn-1").unwrap();
        assert_eq!(entry.failures, 5);
        assert!(entry.unhealthy_until.is_some());
    }

    #[tokio::test]
    async fn cooldown_expiry_allows_reuse_of_the_same_entry() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let keys = key_manager();
        seed_connection(&store, &keys, "conn-1", "user-1").await;

        let pool = GatewayPool::new(store, keys, GatewayPoolConfig::default());
        pool.get_or_create("user-1", "conn-1").await.unwrap();

        {
            let mut entries = pool.entries.write();
            let entry = entries.get_mut("conn-1").unwrap();
            entry.unhealthy_until = Some(Instant::now() - Duration::from_secs(1));
        }

        pool.get_or_create("user-1", "conn-1").await.unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn lru_entry_is_evicted_once_max_size_is_reached() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let keys = key_manager();
        seed_connection(&store, &keys, "conn-1", "user-1").await;
        seed_connection(&store, &keys, "conn-2", "user-1").await;

        let config = GatewayPoolConfig {
            max_size: 1,
            ..GatewayPoolConfig::default()
        };
        let pool = GatewayPool::new(store, keys, config);

        pool.get_or_create("user-1", "conn-1").await.unwrap();
        pool.get_or_create("user-1", "conn-2").await.unwrap();

        assert_eq!(pool.len(), 1);
        assert!(matches!(pool.try_cached("conn-1"), CacheLookup::Absent));
        assert!(matches!(pool.try_cached("conn-2"), CacheLookup::Healthy(_)));
    }
}
