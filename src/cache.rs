use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::planner::Plan;

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_CAPACITY: usize = 100;

/// Recently produced plans keyed by `(prompt, url)`.
pub struct PlanCache {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<String, (Plan, Instant)>>,
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_CAPACITY)
    }
}

impl PlanCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn key(prompt: &str, url: &str) -> String {
        format!("{prompt}\u{1f}{url}")
    }

    pub fn get(&self, prompt: &str, url: &str) -> Option<Plan> {
        self.get_at(prompt, url, Instant::now())
    }

    fn get_at(&self, prompt: &str, url: &str, now: Instant) -> Option<Plan> {
        let key = Self::key(prompt, url);
        let mut entries = self.entries.lock();
        let lookup = entries.get(&key).map(|(plan, stored)| {
            (now.saturating_duration_since(*stored) < self.ttl).then(|| plan.clone())
        });
        match lookup {
            Some(Some(plan)) => Some(plan),
            Some(None) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Stores a plan, evicting the oldest entry when full. A zero capacity
    /// disables caching.
    pub fn insert(&self, prompt: &str, url: &str, plan: Plan) {
        if self.capacity == 0 {
            return;
        }
        let key = Self::key(prompt, url);
        let mut entries = self.entries.lock();
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, (_, stored))| *stored)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(key, (plan, Instant::now()));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::PlanSource;
    use crate::types::{Action, TaskClass};

    fn plan() -> Plan {
        Plan::new(TaskClass::Generic, vec![Action::Screenshot], PlanSource::Rules)
    }

    #[test]
    fn hit_until_ttl_expires() {
        let cache = PlanCache::new(Duration::from_secs(60), 10);
        cache.insert("p", "u", plan());
        assert_eq!(cache.get("p", "u"), Some(plan()));
        assert_eq!(cache.get("p", "other"), None);

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(cache.get_at("p", "u", later), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn evicts_oldest_when_full() {
        let cache = PlanCache::new(Duration::from_secs(60), 2);
        cache.insert("a", "", plan());
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("b", "", plan());
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("c", "", plan());
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a", "").is_none());
        assert!(cache.get("c", "").is_some());
    }

    #[test]
    fn zero_capacity_disables() {
        let cache = PlanCache::new(Duration::from_secs(60), 0);
        cache.insert("a", "", plan());
        assert!(cache.get("a", "").is_none());
    }
}
