//! Records returned by reads.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::key::Key;
use crate::value::Value;

/// Server epoch (2010-01-01T00:00:00Z) as seconds since the Unix epoch.
pub const CITRUSLEAF_EPOCH: u64 = 1_262_304_000;

/// A record and its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Key, when the reply identifies the record.
    pub key: Option<Key>,
    /// Bin values by name.
    pub bins: HashMap<String, Value>,
    /// Write generation.
    pub generation: u32,
    /// Expiration in seconds since the server epoch; zero never expires.
    pub expiration: u32,
}

impl Record {
    /// Creates a record.
    pub fn new(
        key: Option<Key>,
        bins: HashMap<String, Value>,
        generation: u32,
        expiration: u32,
    ) -> Self {
        Self {
            key,
            bins,
            generation,
            expiration,
        }
    }

    /// Returns a bin value.
    pub fn bin(&self, name: &str) -> Option<&Value> {
        self.bins.get(name)
    }

    /// Returns the remaining time to live, or `None` if the record never
    /// expires. Records already past expiration report one second.
    pub fn time_to_live(&self) -> Option<Duration> {
        if self.expiration == 0 {
            return None;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(CITRUSLEAF_EPOCH);
        let since_epoch = now.saturating_sub(CITRUSLEAF_EPOCH);
        let remaining = (self.expiration as u64).saturating_sub(since_epoch);
        Some(Duration::from_secs(remaining.max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_expires() {
        let record = Record::new(None, HashMap::new(), 1, 0);
        assert_eq!(record.time_to_live(), None);
    }

    #[test]
    fn test_expired_reports_one_second() {
        let record = Record::new(None, HashMap::new(), 1, 10);
        assert_eq!(record.time_to_live(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_future_expiration() {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let expiration = (now - CITRUSLEAF_EPOCH + 3600) as u32;
        let record = Record::new(None, HashMap::new(), 1, expiration);
        let ttl = record.time_to_live().unwrap();
        assert!(ttl <= Duration::from_secs(3600));
        assert!(ttl >= Duration::from_secs(3590));
    }
}
