//! Per-tenant sandbox registry: id resolution from cookie or signed header,
//! allocation with idle-TTL and LRU eviction, and minute-bucket rate limits.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use joygate_config::Config;
use joygate_kernel::{is_sandbox_id, minute_bucket, sandbox_header_signature};
use tokio::sync::Mutex;

use crate::error::ApiError;
use crate::store::Store;

struct SandboxEntry {
    store: Arc<Mutex<Store>>,
    last_seen: DateTime<Utc>,
}

/// Global registry; guarded by its own mutex in the app state. Holding the
/// registry lock never requires any per-sandbox lock.
#[derive(Default)]
pub struct SandboxRegistry {
    entries: HashMap<String, SandboxEntry>,
    rate: HashMap<(String, i64), u32>,
}

/// How the request proved its sandbox identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxClaim {
    None,
    Cookie(String),
    Header(String),
}

/// Extracts the claimed sandbox id. The cookie always wins over the header;
/// an invalid or badly signed header claims nothing.
pub fn claim_sandbox_id(
    cfg: &Config,
    cookie_id: Option<&str>,
    header: Option<(&str, &str, &str)>,
    now: DateTime<Utc>,
) -> SandboxClaim {
    if let Some(id) = cookie_id {
        if is_sandbox_id(id) {
            return SandboxClaim::Cookie(id.to_string());
        }
    }
    if !cfg.sandbox.header_mode {
        return SandboxClaim::None;
    }
    let Some(secret) = cfg.sandbox.header_secret.as_deref() else {
        return SandboxClaim::None;
    };
    let Some((id, ts_raw, sig)) = header else {
        return SandboxClaim::None;
    };
    if !is_sandbox_id(id) {
        return SandboxClaim::None;
    }
    let Ok(ts) = ts_raw.parse::<i64>() else {
        return SandboxClaim::None;
    };
    if (now.timestamp() - ts).unsigned_abs() > cfg.sandbox.header_ttl_seconds {
        return SandboxClaim::None;
    }
    if sandbox_header_signature(secret, ts, id) != sig {
        return SandboxClaim::None;
    }
    SandboxClaim::Header(id.to_string())
}

pub fn mint_sandbox_id() -> String {
    let simple = uuid::Uuid::new_v4().as_simple().to_string();
    simple[..16].to_string()
}

impl SandboxRegistry {
    fn evict(&mut self, cfg: &Config, now: DateTime<Utc>) {
        let idle_cutoff = now - chrono::Duration::seconds(cfg.sandbox.idle_ttl_seconds as i64);
        self.entries.retain(|id, e| {
            let keep = e.last_seen > idle_cutoff;
            if !keep {
                tracing::info!(sandbox_id = %id, "evicting idle sandbox");
            }
            keep
        });
        self.trim_to_lru(cfg.sandbox.max_sandboxes);
    }

    fn trim_to_lru(&mut self, cap: usize) {
        while self.entries.len() > cap {
            let lru = self
                .entries
                .iter()
                .min_by_key(|(id, e)| (e.last_seen, (*id).clone()))
                .map(|(id, _)| id.clone());
            match lru {
                Some(id) => {
                    tracing::info!(sandbox_id = %id, "evicting least recently used sandbox");
                    self.entries.remove(&id);
                }
                None => break,
            }
        }
    }

    fn insert(&mut self, cfg: &Config, id: &str, now: DateTime<Utc>) -> Arc<Mutex<Store>> {
        let store = Arc::new(Mutex::new(Store::new(cfg, now)));
        self.entries.insert(
            id.to_string(),
            SandboxEntry {
                store: Arc::clone(&store),
                last_seen: now,
            },
        );
        store
    }

    /// `GET /bootstrap`: reuse a known claimed id, replace an unknown one,
    /// and return None under capacity pressure instead of evicting eagerly.
    pub fn bootstrap(
        &mut self,
        cfg: &Config,
        claimed: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<String> {
        self.evict(cfg, now);
        if let Some(id) = claimed {
            if let Some(entry) = self.entries.get_mut(id) {
                entry.last_seen = now;
                return Some(id.to_string());
            }
        }
        if self.entries.len() >= cfg.sandbox.max_sandboxes {
            return None;
        }
        let id = mint_sandbox_id();
        self.insert(cfg, &id, now);
        Some(id)
    }

    /// Resolves an id to its store for `/v1/*` traffic, allocating on first
    /// sight. At capacity a newcomer displaces the least recently used store.
    pub fn acquire(
        &mut self,
        cfg: &Config,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Arc<Mutex<Store>>, ApiError> {
        self.evict(cfg, now);
        if let Some(entry) = self.entries.get_mut(id) {
            entry.last_seen = now;
            return Ok(Arc::clone(&entry.store));
        }
        if cfg.sandbox.max_sandboxes == 0 {
            return Err(ApiError::Capacity(
                "sandbox capacity exhausted".to_string(),
            ));
        }
        self.trim_to_lru(cfg.sandbox.max_sandboxes - 1);
        Ok(self.insert(cfg, id, now))
    }

    /// Minute-bucket rate limiting per sandbox and per client IP. Buckets
    /// older than the previous minute are dropped on every increment.
    pub fn check_rate(
        &mut self,
        cfg: &Config,
        sandbox_id: &str,
        client_ip: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ApiError> {
        let bucket = minute_bucket(now);
        self.rate.retain(|(_, b), _| *b >= bucket - 1);

        let sb_key = (format!("sb:{sandbox_id}"), bucket);
        let sb = self.rate.entry(sb_key).or_insert(0);
        *sb += 1;
        if *sb > cfg.rate_limit.per_sandbox_per_min {
            return Err(ApiError::RateLimited);
        }

        let ip_key = (format!("ip:{client_ip}"), bucket);
        let ip = self.rate.entry(ip_key).or_insert(0);
        *ip += 1;
        if *ip > cfg.rate_limit.per_ip_per_min {
            return Err(ApiError::RateLimited);
        }
        Ok(())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }
}
