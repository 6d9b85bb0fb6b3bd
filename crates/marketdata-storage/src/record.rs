//! A payload as persisted by a storage backend.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use marketdata_core::{Payload, StorageClassification};

/// One persisted payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Storage key, `{provider}:{receiver_type}:{symbol}`.
    pub key: String,
    /// Category tag.
    pub classification: StorageClassification,
    /// Payload as fetched.
    pub data: Payload,
    /// TTL hint given at write time.
    pub ttl: Duration,
    /// Write time.
    pub stored_at: DateTime<Utc>,
}

impl StoredRecord {
    /// Returns true once the TTL hint has elapsed at `now`.
    ///
    /// A zero TTL never expires.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.ttl.is_zero() {
            return false;
        }
        let ttl = TimeDelta::from_std(self.ttl).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(self.stored_at) > ttl
    }
}
