//! The lease record and its JSON document form.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clients::StoredDocument;
use crate::constants::LEASE_ID_SEPARATOR;
use crate::error::FeedResult;
use crate::types::ContinuationToken;

/// The reserved field names the library reads from a lease document. The rest
/// of the document is opaque to the store and to us.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseBody {
    partition_id: String,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    continuation_token: Option<String>,
    #[serde(default)]
    properties: HashMap<String, String>,
}

/// A durable record granting one host time-bounded exclusive ownership of a
/// partition.
///
/// `timestamp` and `etag` are store-assigned on every mutation; the remaining
/// fields are the document body. A lease is *owned* iff `owner` is set and
/// `now - timestamp` is below the configured expiration interval; otherwise
/// it is expired and may be stolen.
#[derive(Debug, Clone)]
pub struct Lease {
    pub partition_id: String,
    pub owner: Option<String>,
    pub continuation_token: Option<ContinuationToken>,
    pub properties: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub etag: String,
}

impl Lease {
    /// Document id for a partition's lease: `{prefix}..{partition_id}`.
    pub fn document_id(prefix: &str, partition_id: &str) -> String {
        format!("{prefix}{LEASE_ID_SEPARATOR}{partition_id}")
    }

    /// Check whether `host` currently holds this lease (ignoring expiry).
    pub fn is_owned_by(&self, host: &str) -> bool {
        self.owner.as_deref() == Some(host)
    }

    /// Check whether the lease is expired at `now` and may be stolen.
    pub fn is_expired(&self, expiration_interval: Duration, now: DateTime<Utc>) -> bool {
        if self.owner.is_none() {
            return true;
        }
        let age = now.signed_duration_since(self.timestamp);
        age >= chrono::Duration::from_std(expiration_interval)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub(crate) fn from_document(doc: &StoredDocument) -> FeedResult<Self> {
        let body: LeaseBody = serde_json::from_value(doc.body.clone())?;
        Ok(Self {
            partition_id: body.partition_id,
            owner: body.owner.filter(|o| !o.is_empty()),
            continuation_token: body.continuation_token.map(ContinuationToken),
            properties: body.properties,
            timestamp: doc.timestamp,
            etag: doc.etag.clone(),
        })
    }

    pub(crate) fn to_body(&self) -> serde_json::Value {
        let body = LeaseBody {
            partition_id: self.partition_id.clone(),
            owner: self.owner.clone(),
            continuation_token: self
                .continuation_token
                .as_ref()
                .map(|t| t.as_str().to_string()),
            properties: self.properties.clone(),
        };
        // LeaseBody serialization cannot fail: string keys, no non-string maps.
        serde_json::to_value(body).unwrap_or(serde_json::Value::Null)
    }

    /// Body for a brand-new, unowned lease.
    pub(crate) fn new_body(
        partition_id: &str,
        continuation_token: Option<&ContinuationToken>,
    ) -> serde_json::Value {
        let body = LeaseBody {
            partition_id: partition_id.to_string(),
            owner: None,
            continuation_token: continuation_token.map(|t| t.as_str().to_string()),
            properties: HashMap::new(),
        };
        serde_json::to_value(body).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(body: serde_json::Value) -> StoredDocument {
        StoredDocument {
            id: "prefix..0".to_string(),
            etag: "1".to_string(),
            timestamp: Utc::now(),
            body,
        }
    }

    #[test]
    fn document_id_layout() {
        assert_eq!(Lease::document_id("cf", "range-7"), "cf..range-7");
    }

    #[test]
    fn round_trip_through_document() {
        let body = serde_json::json!({
            "partition_id": "0",
            "owner": "host-a",
            "continuation_token": "41",
            "properties": {"k": "v"}
        });
        let lease = Lease::from_document(&doc(body)).unwrap();
        assert_eq!(lease.partition_id, "0");
        assert!(lease.is_owned_by("host-a"));
        assert_eq!(lease.continuation_token.as_ref().unwrap().as_str(), "41");
        assert_eq!(lease.properties.get("k").map(String::as_str), Some("v"));

        let back = lease.to_body();
        assert_eq!(back["owner"], "host-a");
        assert_eq!(back["continuation_token"], "41");
    }

    #[test]
    fn empty_owner_means_unowned() {
        let body = serde_json::json!({"partition_id": "0", "owner": ""});
        let lease = Lease::from_document(&doc(body)).unwrap();
        assert!(lease.owner.is_none());
        assert!(lease.is_expired(Duration::from_secs(60), Utc::now()));
    }

    #[test]
    fn expiry_threshold() {
        let body = serde_json::json!({"partition_id": "0", "owner": "host-a"});
        let mut lease = Lease::from_document(&doc(body)).unwrap();
        let now = Utc::now();

        lease.timestamp = now - chrono::Duration::seconds(30);
        assert!(!lease.is_expired(Duration::from_secs(60), now));

        lease.timestamp = now - chrono::Duration::seconds(61);
        assert!(lease.is_expired(Duration::from_secs(60), now));
    }

    #[test]
    fn missing_optional_fields_default() {
        let lease = Lease::from_document(&doc(serde_json::json!({"partition_id": "9"}))).unwrap();
        assert!(lease.owner.is_none());
        assert!(lease.continuation_token.is_none());
        assert!(lease.properties.is_empty());
    }
}
