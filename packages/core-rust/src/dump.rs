//! Record export dumps and the backup framing constants.
//!
//! A [`RecordDump`] is the wire-stable JSON form a record exports to: it is
//! what event payloads carry as `item` and what backup streams write one per
//! `RECORD` line. Restore re-materializes records from the same form.

use serde::{Deserialize, Serialize};

use crate::stats::RecordStats;
use crate::types::{CacheFlavor, Value};

/// First line of every backup stream.
pub const BACKUP_MAGIC: &str = "CACHE_BACKUP v1";
/// Prefix of the creation-timestamp line.
pub const BACKUP_CREATED_AT_PREFIX: &str = "CREATED_AT ";
/// Prefix of each record line.
pub const BACKUP_RECORD_PREFIX: &str = "RECORD ";
/// Terminator line of a backup stream.
pub const BACKUP_END: &str = "END_BACKUP";

/// Length of the initialization vector prepended to an encrypted stream body.
pub const CIPHER_IV_LEN: usize = 16;
/// Processing block size of the encrypting transform, in bytes.
pub const CIPHER_BLOCK_SIZE: usize = 1_048_576;

/// TTL tunables as exported (policy is a runtime concern and stays out of
/// the wire form).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlDump {
    pub value: u64,
    pub sliding: bool,
}

/// File-specific fields of a file record dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDump {
    pub path: String,
    pub name: String,
    #[serde(rename = "eTag")]
    pub e_tag: String,
    pub size: u64,
    pub is_cached: bool,
}

/// The complete export form of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordDump {
    pub flavor: CacheFlavor,
    pub engines: Vec<String>,
    pub scope: String,
    pub key: String,
    pub stats: RecordStats,
    pub ttl: TtlDump,
    /// KV payload. Absent for file records.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<Value>,
    /// File metadata. Absent for KV records.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub file: Option<FileDump>,
}

impl RecordDump {
    /// Serializes the dump as the JSON object event payloads embed.
    ///
    /// Serialization of these derived types cannot fail.
    #[must_use]
    pub fn to_item(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Whether this dump's record was already expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.stats
            .dates
            .expire_at
            .is_some_and(|expire_at| expire_at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::RecordStats;

    fn kv_dump() -> RecordDump {
        RecordDump {
            flavor: CacheFlavor::Kvs,
            engines: vec!["memory".to_string()],
            scope: "global".to_string(),
            key: "a".to_string(),
            stats: RecordStats::new(1_000, 16),
            ttl: TtlDump {
                value: 300_000,
                sliding: true,
            },
            value: Some(Value::string("1")),
            file: None,
        }
    }

    #[test]
    fn kv_dump_wire_shape() {
        let json = kv_dump().to_item();
        assert_eq!(json["flavor"], "kvs");
        assert_eq!(json["engines"][0], "memory");
        assert_eq!(json["ttl"]["value"], 300_000);
        assert_eq!(json["ttl"]["sliding"], true);
        assert!(json.get("file").is_none());
        assert_eq!(json["value"]["kind"], "json");
    }

    #[test]
    fn file_dump_uses_etag_casing() {
        let dump = RecordDump {
            flavor: CacheFlavor::Files,
            engines: vec!["memory".to_string()],
            scope: "global".to_string(),
            key: "L3QvYS50eHQ=".to_string(),
            stats: RecordStats::new(1_000, 0),
            ttl: TtlDump {
                value: 0,
                sliding: true,
            },
            value: None,
            file: Some(FileDump {
                path: "/t/a.txt".to_string(),
                name: "a.txt".to_string(),
                e_tag: "MTItMzQ=".to_string(),
                size: 12,
                is_cached: true,
            }),
        };
        let json = dump.to_item();
        assert_eq!(json["file"]["eTag"], "MTItMzQ=");
        assert_eq!(json["file"]["isCached"], true);
        assert!(json.get("value").is_none());
    }

    #[test]
    fn dump_round_trips_through_record_line_form() {
        let dump = kv_dump();
        let line = format!("{BACKUP_RECORD_PREFIX}{}", serde_json::to_string(&dump).unwrap());
        let json_part = line.strip_prefix(BACKUP_RECORD_PREFIX).unwrap();
        let back: RecordDump = serde_json::from_str(json_part).unwrap();
        assert_eq!(back, dump);
    }

    #[test]
    fn expiry_check_uses_expire_at() {
        let mut dump = kv_dump();
        assert!(!dump.is_expired_at(i64::MAX));

        dump.stats.dates.expire_at = Some(5_000);
        assert!(dump.is_expired_at(5_000));
        assert!(dump.is_expired_at(6_000));
        assert!(!dump.is_expired_at(4_999));
    }
}
