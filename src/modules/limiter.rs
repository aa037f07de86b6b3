use std::collections::HashMap;
use std::time::Duration;

use crate::modules::records::PairKey;
use crate::modules::task::RequestKind;

/// Per-agent minimum spacing between accepted submissions.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_allowed: HashMap<String, Duration>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_allowed: HashMap::new(),
        }
    }

    /// Accepts `agent` when more than the minimum interval passed since its
    /// last accepted submission and records `now`. Otherwise returns how long
    /// the agent still has to wait.
    pub fn allow(&mut self, agent: &str, now: Duration) -> Result<(), Duration> {
        if let Some(previous) = self.last_allowed.get(agent) {
            let elapsed = now.saturating_sub(*previous);
            if elapsed <= self.min_interval {
                return Err(self.min_interval - elapsed);
            }
        }
        self.last_allowed.insert(agent.to_string(), now);
        Ok(())
    }
}

/// Who a cached text was generated for. Pair scopes ignore speaker order.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    scope: String,
    kind: RequestKind,
}

impl CacheKey {
    pub fn pair(a: &str, b: &str, kind: RequestKind) -> Self {
        Self {
            scope: PairKey::new(a, b).to_string(),
            kind,
        }
    }

    pub fn solo(agent: &str, kind: RequestKind) -> Self {
        Self {
            scope: agent.to_string(),
            kind,
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    text: String,
    stored_at: Duration,
}

/// Short-lived memo of generated texts. Expired entries are evicted when looked up.
#[derive(Debug)]
pub struct ResponseCache {
    ttl: Duration,
    entries: HashMap<CacheKey, CacheEntry>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn get(&mut self, key: &CacheKey, now: Duration) -> Option<String> {
        let fresh = self
            .entries
            .get(key)
            .map(|entry| now.saturating_sub(entry.stored_at) < self.ttl)?;
        if fresh {
            self.entries.get(key).map(|entry| entry.text.clone())
        } else {
            self.entries.remove(key);
            None
        }
    }

    pub fn put(&mut self, key: CacheKey, text: String, now: Duration) {
        self.entries.insert(key, CacheEntry { text, stored_at: now });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn second_request_inside_interval_is_refused() {
        let mut limiter = RateLimiter::new(MINUTE);
        assert!(limiter.allow("a", Duration::from_secs(10)).is_ok());

        let wait = limiter.allow("a", Duration::from_secs(40)).unwrap_err();
        assert_eq!(wait, Duration::from_secs(30));

        assert!(limiter.allow("b", Duration::from_secs(40)).is_ok());
        assert!(limiter.allow("a", Duration::from_secs(70)).is_err());
        assert!(limiter.allow("a", Duration::from_secs(71)).is_ok());
    }

    #[test]
    fn refused_request_does_not_reset_the_window() {
        let mut limiter = RateLimiter::new(MINUTE);
        limiter.allow("a", Duration::ZERO).unwrap();
        limiter.allow("a", Duration::from_secs(59)).unwrap_err();
        assert!(limiter.allow("a", Duration::from_secs(61)).is_ok());
    }

    #[test]
    fn cache_is_order_independent_and_expires() {
        let mut cache = ResponseCache::new(Duration::from_secs(120));
        let key = CacheKey::pair("Neuron-1", "Synth-2", RequestKind::FirstMessage);
        cache.put(key, "hello".into(), Duration::from_secs(5));

        let reversed = CacheKey::pair("Synth-2", "Neuron-1", RequestKind::FirstMessage);
        assert_eq!(cache.get(&reversed, Duration::from_secs(100)), Some("hello".into()));

        let other_kind = CacheKey::pair("Neuron-1", "Synth-2", RequestKind::Response);
        assert_eq!(cache.get(&other_kind, Duration::from_secs(100)), None);

        assert_eq!(cache.get(&reversed, Duration::from_secs(125)), None);
        assert!(cache.is_empty());
    }
}
