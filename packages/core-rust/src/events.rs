//! Event vocabulary and wire-stable payloads.
//!
//! Every lifecycle step in the runtime emits an [`EventPayload`] on the
//! owning flavor's bus. Payloads serialize camelCase and carry the record
//! dump as `item`, plus the optional reason/status/delta/paths fields the
//! specific event kind uses.

use serde::{Deserialize, Serialize};

use crate::types::CacheFlavor;

/// The fixed event set of a flavor bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Create,
    Read,
    Update,
    Touch,
    Hit,
    Miss,
    Evict,
    Expire,
    Remove,
    BulkRemove,
    Clear,
    FileContentSizeChange,
    FileRenameChange,
}

/// Why a record (or batch) was removed.
///
/// Wire names follow the dotted convention for the composite reasons
/// (`memory.limit`, `file.delete`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoveReason {
    #[serde(rename = "manual")]
    Manual,
    #[serde(rename = "clear")]
    Clear,
    #[serde(rename = "expire")]
    Expire,
    #[serde(rename = "lru")]
    Lru,
    #[serde(rename = "fifo")]
    Fifo,
    #[serde(rename = "lfu")]
    Lfu,
    #[serde(rename = "idle")]
    Idle,
    #[serde(rename = "memory.limit")]
    MemoryLimit,
    #[serde(rename = "file.delete")]
    FileDelete,
    #[serde(rename = "file.rename")]
    FileRename,
    #[serde(rename = "file.exceedSizeLimit")]
    FileExceedSizeLimit,
}

/// Outcome of a read, attached to `read` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadStatus {
    Hit,
    Miss,
}

/// Old and new path of a renamed file record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenamePaths {
    pub from: String,
    pub to: String,
}

/// Aggregated decrement carried by `bulkRemove` events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkStatsDelta {
    /// Number of records in the batch.
    pub count: u64,
    /// Sum of the batch's `stats.size` values.
    pub size: u64,
}

/// One event as emitted on a flavor bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub flavor: CacheFlavor,
    /// Record dump of the subject (a descriptor-only object for events
    /// with no live record, e.g. a miss on an unknown key).
    pub item: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<RemoveReason>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<ReadStatus>,
    /// Signed content-size change, on `fileContentSizeChange`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub delta: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub paths: Option<RenamePaths>,
    /// Batch of record dumps, on `bulkRemove`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub items: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stats_delta: Option<BulkStatsDelta>,
}

impl EventPayload {
    /// A plain event carrying only the record dump.
    #[must_use]
    pub fn new(kind: EventKind, flavor: CacheFlavor, item: serde_json::Value) -> Self {
        Self {
            kind,
            flavor,
            item,
            reason: None,
            status: None,
            delta: None,
            paths: None,
            items: None,
            stats_delta: None,
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: RemoveReason) -> Self {
        self.reason = Some(reason);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: ReadStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_delta(mut self, delta: i64) -> Self {
        self.delta = Some(delta);
        self
    }

    #[must_use]
    pub fn with_paths(mut self, from: String, to: String) -> Self {
        self.paths = Some(RenamePaths { from, to });
        self
    }

    /// A `bulkRemove` event for a batch of dumps.
    #[must_use]
    pub fn bulk_remove(
        flavor: CacheFlavor,
        reason: RemoveReason,
        items: Vec<serde_json::Value>,
        stats_delta: BulkStatsDelta,
    ) -> Self {
        let mut payload = Self::new(EventKind::BulkRemove, flavor, serde_json::Value::Null);
        payload.reason = Some(reason);
        payload.items = Some(items);
        payload.stats_delta = Some(stats_delta);
        payload
    }
}
