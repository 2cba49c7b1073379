//! Per-tenant rule cache in front of the Storage Port.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::storage::{Rule, StorageError, StoragePort};

/// How long a tenant's rules are served from cache.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

struct CacheEntry {
    rules: Arc<Vec<Rule>>,
    fetched_at: Instant,
}

#[derive(Default)]
struct Cache {
    entries: HashMap<String, CacheEntry>,
    /// Bumped on every invalidation. A refresh only stores its result if
    /// the generation it started from is still current.
    generations: HashMap<String, u64>,
}

impl Cache {
    fn generation(&self, tenant_id: &str) -> u64 {
        self.generations.get(tenant_id).copied().unwrap_or(0)
    }
}

/// Cached, write-through access to tenant rules.
///
/// Concurrent misses for one tenant collapse into a single storage fetch;
/// readers of a fresh entry never wait on a refresh.
#[derive(Clone)]
pub struct RuleStore {
    storage: Arc<dyn StoragePort>,
    ttl: Duration,
    cache: Arc<RwLock<Cache>>,
    refresh_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl std::fmt::Debug for RuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleStore")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl RuleStore {
    pub fn new(storage: Arc<dyn StoragePort>) -> Self {
        Self::with_ttl(storage, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(storage: Arc<dyn StoragePort>, ttl: Duration) -> Self {
        Self {
            storage,
            ttl,
            cache: Arc::new(RwLock::new(Cache::default())),
            refresh_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn cached(&self, tenant_id: &str) -> Option<Arc<Vec<Rule>>> {
        let cache = self.cache.read().ok()?;
        let entry = cache.entries.get(tenant_id)?;
        (entry.fetched_at.elapsed() < self.ttl).then(|| Arc::clone(&entry.rules))
    }

    fn refresh_lock(&self, tenant_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>, StorageError> {
        let mut locks = self
            .refresh_locks
            .lock()
            .map_err(|_| StorageError::Internal("rule refresh lock poisoned".to_string()))?;
        Ok(Arc::clone(locks.entry(tenant_id.to_string()).or_default()))
    }

    /// Drop the tenant's refresh lock unless another task still holds it.
    fn release_refresh_lock(&self, tenant_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        if let Ok(mut locks) = self.refresh_locks.lock()
            && locks
                .get(tenant_id)
                .is_some_and(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(held) == 2)
        {
            locks.remove(tenant_id);
        }
    }

    async fn refresh(&self, tenant_id: &str) -> Result<Arc<Vec<Rule>>, StorageError> {
        // Another task may have refreshed while we waited.
        if let Some(rules) = self.cached(tenant_id) {
            return Ok(rules);
        }

        let generation = self
            .cache
            .read()
            .map(|c| c.generation(tenant_id))
            .unwrap_or(0);
        let rules = Arc::new(self.storage.read_rules(tenant_id).await?);

        if let Ok(mut cache) = self.cache.write() {
            if cache.generation(tenant_id) == generation {
                cache.entries.insert(
                    tenant_id.to_string(),
                    CacheEntry {
                        rules: Arc::clone(&rules),
                        fetched_at: Instant::now(),
                    },
                );
                tracing::debug!(tenant_id, count = rules.len(), "Rule cache refreshed");
            } else {
                tracing::debug!(tenant_id, "Rules changed during refresh, not caching");
            }
        }
        Ok(rules)
    }

    /// Rules of a tenant, highest priority first.
    pub async fn get_rules(&self, tenant_id: &str) -> Result<Arc<Vec<Rule>>, StorageError> {
        if let Some(rules) = self.cached(tenant_id) {
            return Ok(rules);
        }

        let lock = self.refresh_lock(tenant_id)?;
        let result = {
            let _guard = lock.lock().await;
            self.refresh(tenant_id).await
        };
        self.release_refresh_lock(tenant_id, lock);
        result
    }

    /// Persist a rule and evict the tenant's cache entry.
    pub async fn add_rule(&self, rule: &Rule) -> Result<(), StorageError> {
        self.storage.insert_rule(rule).await?;
        self.invalidate(&rule.tenant_id);
        tracing::info!(tenant_id = %rule.tenant_id, rule_id = %rule.id, name = %rule.name, "Rule created");
        Ok(())
    }

    /// Delete a rule and evict the tenant's cache entry.
    pub async fn delete_rule(&self, tenant_id: &str, rule_id: Uuid) -> Result<bool, StorageError> {
        let deleted = self.storage.delete_rule(tenant_id, rule_id).await?;
        self.invalidate(tenant_id);
        if deleted {
            tracing::info!(tenant_id, rule_id = %rule_id, "Rule deleted");
        }
        Ok(deleted)
    }

    pub fn invalidate(&self, tenant_id: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.entries.remove(tenant_id);
            *cache.generations.entry(tenant_id.to_string()).or_default() += 1;
        }
    }
}
