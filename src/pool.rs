//! Client pool.
//!
//! In distinct-user mode every iteration gets a fresh client and jar, and
//! returned clients are dropped. In repeated-user mode clients go back on
//! the queue so their cookies and connections carry into later iterations.

use crate::cookie::{CookieJar, SeedCookie};
use crate::model::{EngineMode, TICKS_PER_SECOND};
use crate::transport::Client;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::debug;
use url::Url;

pub struct ClientPool {
    mode: EngineMode,
    seeds: Vec<SeedCookie>,
    seed_target: Url,
    capacity: usize,
    clients: Mutex<VecDeque<Client>>,
}

impl ClientPool {
    /// `seeds` pre-populate every new jar, filtered against the scheme of
    /// `seed_target`.
    pub fn new(mode: EngineMode, seeds: Vec<SeedCookie>, seed_target: Url, capacity: usize) -> Self {
        Self {
            mode,
            seeds,
            seed_target,
            capacity: capacity.max(1),
            clients: Mutex::new(VecDeque::new()),
        }
    }

    /// Capacity for a request-count vector: ten times its busiest tick.
    pub fn capacity_for(vector: &[u64]) -> usize {
        let peak = vector.iter().copied().max().unwrap_or(0) as usize;
        (TICKS_PER_SECOND * peak).max(1)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A queued client, or a new one when the queue is empty.
    pub fn get(&self) -> Client {
        if let Some(client) = self.clients.lock().pop_front() {
            return client;
        }
        self.make()
    }

    /// Return a client after an iteration.
    pub fn put(&self, client: Client) {
        if self.mode == EngineMode::DistinctUser {
            client.close_idle();
            return;
        }
        let mut clients = self.clients.lock();
        if clients.len() < self.capacity {
            clients.push_back(client);
        } else {
            client.close_idle();
        }
    }

    /// Drop every queued client.
    pub fn drain(&self) {
        let drained: Vec<Client> = self.clients.lock().drain(..).collect();
        debug!("Draining {} pooled clients", drained.len());
        for client in drained {
            client.close_idle();
        }
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn make(&self) -> Client {
        let jar = if self.seeds.is_empty() {
            CookieJar::new()
        } else {
            CookieJar::seeded(&self.seeds, &self.seed_target)
        };
        Client::new(jar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Url {
        Url::parse("http://localhost/").unwrap()
    }

    #[test]
    fn test_capacity() {
        assert_eq!(ClientPool::capacity_for(&[0, 0]), 1);
        assert_eq!(ClientPool::capacity_for(&[1, 4, 2]), 40);
    }

    #[test]
    fn test_distinct_user_discards() {
        let pool = ClientPool::new(EngineMode::DistinctUser, vec![], target(), 4);
        let client = pool.get();
        pool.put(client);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_repeated_user_reuses_jar() {
        let pool = ClientPool::new(EngineMode::RepeatedUser, vec![], target(), 1);
        let client = pool.get();
        let cookie = crate::cookie::ResponseCookie::parse("sid=A").unwrap();
        client.jar().set_cookies(&target(), &[cookie]);
        pool.put(client);
        pool.put(Client::default());
        assert_eq!(pool.len(), 1);

        let again = pool.get();
        assert_eq!(again.jar().header_for(&target()).as_deref(), Some("sid=A"));
        pool.drain();
        assert!(pool.is_empty());
    }

    #[test]
    fn test_seeded_jars_filter_secure_cookies() {
        let seeds: Vec<SeedCookie> = serde_json::from_str(
            r#"[{"name": "a", "value": "1", "domain": "localhost"},
                {"name": "b", "value": "2", "domain": "localhost", "secure": true}]"#,
        )
        .unwrap();
        let pool = ClientPool::new(EngineMode::DistinctUser, seeds, target(), 4);
        let client = pool.get();
        assert_eq!(client.jar().header_for(&target()).as_deref(), Some("a=1"));
    }
}
