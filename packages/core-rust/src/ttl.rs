//! Time-to-live specification for records.
//!
//! [`TtlSpec`] carries the per-record expiration tunables; the runtime's TTL
//! job turns a spec plus access dates into a scheduled instant. Policy
//! admissibility depends on the record flavor (see [`TtlPolicy::supported_by`]).

use serde::{Deserialize, Serialize};

use crate::types::CacheFlavor;

/// What happens when a record's TTL fires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtlPolicy {
    /// Remove the record (`expire` event, then `remove` with reason `expire`).
    #[default]
    Evict,
    /// Drop cached content but keep the record alive. Files only.
    Keep,
    /// Reload from source. Reserved for a future flavor; rejected when
    /// scheduling.
    Refresh,
}

impl TtlPolicy {
    /// Whether this policy is admissible for records of the given flavor.
    ///
    /// KV records support only `evict`; `keep` is meaningful where a record
    /// has a backing source to fall back to (files, and the future
    /// `database` flavor). `refresh` is not yet schedulable anywhere.
    #[must_use]
    pub fn supported_by(self, flavor: CacheFlavor) -> bool {
        match self {
            Self::Evict => true,
            Self::Keep => flavor == CacheFlavor::Files,
            Self::Refresh => false,
        }
    }
}

/// Per-record TTL tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtlSpec {
    /// TTL duration in milliseconds. 0 disables expiration.
    pub value: u64,
    /// When true the TTL is measured from the last access instead of from
    /// creation.
    pub sliding: bool,
    #[serde(default)]
    pub policy: TtlPolicy,
}

impl Default for TtlSpec {
    fn default() -> Self {
        Self {
            value: 300_000,
            sliding: true,
            policy: TtlPolicy::Evict,
        }
    }
}

impl TtlSpec {
    /// A spec that never expires.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            value: 0,
            sliding: true,
            policy: TtlPolicy::Evict,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.value > 0
    }

    /// Computes the absolute expiration instant for a record created at
    /// `created` and last accessed at `last_access`.
    ///
    /// Returns `None` when the TTL is disabled. Sliding TTLs anchor on the
    /// last access (falling back to creation); fixed TTLs anchor on creation.
    #[must_use]
    pub fn expire_instant(&self, created: i64, last_access: Option<i64>) -> Option<i64> {
        if !self.is_enabled() {
            return None;
        }
        let anchor = if self.sliding {
            last_access.unwrap_or(created)
        } else {
            created
        };
        // TTL values are millisecond durations, far below i64::MAX.
        #[allow(clippy::cast_possible_wrap)]
        let expire_at = anchor + self.value as i64;
        Some(expire_at)
    }

    /// Validates the policy against the record flavor.
    pub fn validate_for(&self, flavor: CacheFlavor) -> Result<(), TtlError> {
        if self.is_enabled() && !self.policy.supported_by(flavor) {
            return Err(TtlError::PolicyNotSupported {
                policy: self.policy,
                flavor,
            });
        }
        Ok(())
    }
}

/// Violations of the TTL constraints.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TtlError {
    #[error("ttl policy {policy:?} is not supported by flavor {flavor}")]
    PolicyNotSupported {
        policy: TtlPolicy,
        flavor: CacheFlavor,
    },
}
