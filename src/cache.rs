//
// Per-process user cache
//
// Bounded, TTL'd snapshot of the user row keyed by id. Expired entries are
// treated as misses and reloaded (lazy TTL). Every mutating user operation
// invalidates its entry before returning; the ban and role gates bypass the
// cache entirely and read the store.
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::db::models::{User, UserId};
use crate::CONFIG;

pub static USER_CACHE: Lazy<UserCache> =
    Lazy::new(|| UserCache::new(CONFIG.user_cache_capacity, Duration::from_secs(CONFIG.user_cache_ttl_secs)));

pub struct UserCache {
    cache: Cache<UserId, Arc<User>>,
    capacity: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl UserCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            cache: Cache::builder().max_capacity(capacity).time_to_live(ttl).build(),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached snapshot, or loads, stores and returns it. A
    /// loader returning `None` (user deleted) is not cached.
    pub async fn get_or_load<F, Fut>(&self, id: UserId, loader: F) -> Option<Arc<User>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<User>>,
    {
        if let Some(user) = self.cache.get(&id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(user);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        match loader().await {
            Some(user) => {
                let user = Arc::new(user);
                self.cache.insert(id, Arc::clone(&user));
                Some(user)
            }
            None => None,
        }
    }

    pub fn invalidate(&self, id: UserId) {
        self.cache.invalidate(&id);
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.run_pending_tasks();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStats {
            size: self.cache.entry_count(),
            capacity: self.capacity,
            hits,
            misses,
            hit_ratio: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64
            },
        }
    }
}

pub struct CacheStats {
    pub size: u64,
    pub capacity: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
}

impl CacheStats {
    pub fn to_json(&self) -> Value {
        json!({
            "size": self.size,
            "capacity": self.capacity,
            "hits": self.hits,
            "misses": self.misses,
            "hitRatio": self.hit_ratio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(id: i64) -> User {
        let now = Utc::now().naive_utc();
        User {
            id: UserId::from(id),
            username: format!("user{id}"),
            email: format!("user{id}@example.com"),
            password_hash: String::new(),
            avatar: String::new(),
            role: 0,
            microsoft_id: None,
            microsoft_name: None,
            microsoft_avatar_url: None,
            microsoft_avatar_hash: None,
            banned: false,
            ban_reason: None,
            banned_at: None,
            banned_by: None,
            unban_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[rocket::async_test]
    async fn test_get_or_load_caches_and_counts() {
        let cache = UserCache::new(10, Duration::from_secs(60));
        let id = UserId::from(1);

        let loaded = cache.get_or_load(id, || async { Some(user(1)) }).await;
        assert_eq!(loaded.unwrap().username, "user1");

        // Second read must come from the cache; the loader would panic.
        let cached = cache.get_or_load(id, || async { panic!("loader should not run") }).await;
        assert!(cached.is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[rocket::async_test]
    async fn test_invalidate_forces_reload() {
        let cache = UserCache::new(10, Duration::from_secs(60));
        let id = UserId::from(7);

        cache.get_or_load(id, || async { Some(user(7)) }).await;
        cache.invalidate(id);

        let mut reloaded = false;
        cache
            .get_or_load(id, || {
                reloaded = true;
                async { Some(user(7)) }
            })
            .await;
        assert!(reloaded);
    }

    #[rocket::async_test]
    async fn test_expired_entry_is_a_miss() {
        let cache = UserCache::new(10, Duration::from_millis(20));
        let id = UserId::from(3);

        cache.get_or_load(id, || async { Some(user(3)) }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut reloaded = false;
        cache
            .get_or_load(id, || {
                reloaded = true;
                async { Some(user(3)) }
            })
            .await;
        assert!(reloaded);
        assert_eq!(cache.stats().misses, 2);
    }

    #[rocket::async_test]
    async fn test_missing_user_is_not_cached() {
        let cache = UserCache::new(10, Duration::from_secs(60));
        let id = UserId::from(9);

        let missing = cache.get_or_load(id, || async { None }).await;
        assert!(missing.is_none());

        let mut loader_ran = false;
        cache
            .get_or_load(id, || {
                loader_ran = true;
                async { None }
            })
            .await;
        assert!(loader_ran);
    }
}
