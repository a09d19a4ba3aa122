//! Per-user shard maps
//!
//! A shard map tells where each database and table lives. Maps are built by
//! one session, published to the [`ShardManager`] and shared as immutable
//! snapshots by all sessions of the same user until they become stale.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

/// database -> table -> servers holding it. The empty table name stands for
/// the database itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerMap {
    content: HashMap<String, HashMap<String, BTreeSet<String>>>,
}

impl ServerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names are stored lowercase
    pub fn add_location(&mut self, db: &str, table: &str, server: &str) {
        self.content
            .entry(db.to_lowercase())
            .or_default()
            .entry(table.to_lowercase())
            .or_default()
            .insert(server.to_string());
    }

    /// Servers holding `db.table`
    pub fn table_locations(&self, db: &str, table: &str) -> BTreeSet<String> {
        self.content
            .get(&db.to_lowercase())
            .and_then(|tables| tables.get(&table.to_lowercase()))
            .cloned()
            .unwrap_or_default()
    }

    /// Servers holding any part of `db`
    pub fn database_locations(&self, db: &str) -> BTreeSet<String> {
        self.content
            .get(&db.to_lowercase())
            .map(|tables| tables.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Server a database-level statement should go to
    pub fn database_location(&self, db: &str) -> Option<String> {
        self.database_locations(db).into_iter().next()
    }

    pub fn has_database(&self, db: &str) -> bool {
        self.content.contains_key(&db.to_lowercase())
    }

    /// Sorted database names
    pub fn databases(&self) -> Vec<String> {
        let mut dbs: Vec<String> = self.content.keys().cloned().collect();
        dbs.sort();
        dbs
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// An immutable shard map snapshot
#[derive(Debug, Clone)]
pub struct Shard {
    map: Arc<ServerMap>,
    last_updated: Instant,
}

impl Shard {
    pub fn new(map: ServerMap) -> Self {
        Self {
            map: Arc::new(map),
            last_updated: Instant::now(),
        }
    }

    pub fn map(&self) -> &Arc<ServerMap> {
        &self.map
    }

    pub fn stale(&self, max_age: Duration) -> bool {
        self.last_updated.elapsed() > max_age
    }

    pub fn newer_than(&self, other: &Shard) -> bool {
        self.last_updated > other.last_updated
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[derive(Default)]
struct ManagerInner {
    maps: HashMap<String, Shard>,
    updates: HashMap<String, u64>,
}

/// Shared shard maps of all users
pub struct ShardManager {
    inner: Mutex<ManagerInner>,
    update_limit: u64,
    max_age: Duration,
}

impl ShardManager {
    pub fn new(update_limit: u64, max_age: Duration) -> Self {
        Self {
            inner: Mutex::new(ManagerInner::default()),
            update_limit,
            max_age,
        }
    }

    /// Current map of a user, None if missing or stale
    pub fn get_shard(&self, user: &str) -> Option<Shard> {
        let mut inner = self.inner.lock();
        match inner.maps.get(user) {
            Some(shard) if !shard.stale(self.max_age) => Some(shard.clone()),
            Some(_) => {
                inner.maps.remove(user);
                None
            }
            None => None,
        }
    }

    /// Reserve the right to build a new map for a user
    pub fn start_update(&self, user: &str) -> bool {
        let mut inner = self.inner.lock();
        let running = inner.updates.entry(user.to_string()).or_insert(0);
        if *running < self.update_limit {
            *running += 1;
            true
        } else {
            false
        }
    }

    /// Publish a map built after a successful `start_update`
    pub fn update_shard(&self, user: &str, shard: Shard) {
        let mut inner = self.inner.lock();
        let replace = inner
            .maps
            .get(user)
            .map_or(true, |current| shard.newer_than(current));
        if replace {
            info!(user = %user, "Updated shard map");
            inner.maps.insert(user.to_string(), shard);
        }
        Self::release(&mut inner, user);
    }

    /// Give up an update reserved with `start_update`
    pub fn cancel_update(&self, user: &str) {
        let mut inner = self.inner.lock();
        Self::release(&mut inner, user);
    }

    fn release(inner: &mut ManagerInner, user: &str) {
        if let Some(running) = inner.updates.get_mut(user) {
            *running = running.saturating_sub(1);
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ServerMap {
        let mut map = ServerMap::new();
        map.add_location("Shop", "", "s1");
        map.add_location("shop", "Orders", "s1");
        map.add_location("crm", "", "s2");
        map.add_location("crm", "contacts", "s2");
        map
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let map = sample();
        assert_eq!(
            map.table_locations("SHOP", "orders").into_iter().collect::<Vec<_>>(),
            vec!["s1"]
        );
        assert_eq!(map.database_location("CRM").as_deref(), Some("s2"));
        assert!(map.table_locations("shop", "missing").is_empty());
        assert!(map.database_location("nope").is_none());
        assert_eq!(map.databases(), vec!["crm", "shop"]);
    }

    #[test]
    fn test_stale_maps_are_dropped() {
        let manager = ShardManager::new(1, Duration::from_millis(20));
        assert!(manager.start_update("app"));
        manager.update_shard("app", Shard::new(sample()));
        assert!(manager.get_shard("app").is_some());

        std::thread::sleep(Duration::from_millis(40));
        assert!(manager.get_shard("app").is_none());
    }

    #[test]
    fn test_update_limit() {
        let manager = ShardManager::new(1, Duration::from_secs(60));
        assert!(manager.start_update("app"));
        assert!(!manager.start_update("app"));
        // Other users are independent
        assert!(manager.start_update("other"));

        manager.cancel_update("app");
        assert!(manager.start_update("app"));
        manager.update_shard("app", Shard::new(sample()));
        assert!(manager.start_update("app"));
    }

    #[test]
    fn test_older_map_does_not_replace_newer() {
        let manager = ShardManager::new(2, Duration::from_secs(60));
        let older = Shard::new(ServerMap::new());
        std::thread::sleep(Duration::from_millis(2));
        let newer = Shard::new(sample());

        manager.start_update("app");
        manager.start_update("app");
        manager.update_shard("app", newer);
        manager.update_shard("app", older);
        assert!(!manager.get_shard("app").unwrap().is_empty());
    }
}
