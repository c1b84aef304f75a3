//! Typed ID definitions for capacity resources.

use crate::define_id;
use crate::IdError;

// =============================================================================
// Engine-assigned IDs
// =============================================================================

define_id!(WorkspaceId, "ws", "A tenant workspace that consumes capacity.");
define_id!(AllocationId, "alloc", "The binding of a workspace to its capacity source.");
define_id!(NodeId, "node", "A dedicated node tracked by the engine.");
define_id!(NodeEventId, "nevt", "One entry in the node event history.");

// =============================================================================
// Event Sequence
// =============================================================================

/// Store-assigned position of an event in the append-only history.
///
/// Sequences are strictly increasing in commit order, which is what
/// newest-first listings sort on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventSeq(i64);

impl EventSeq {
    #[must_use]
    pub const fn new(seq: i64) -> Self {
        Self(seq)
    }

    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for EventSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EventSeq {
    fn from(seq: i64) -> Self {
        Self(seq)
    }
}

impl From<EventSeq> for i64 {
    fn from(seq: EventSeq) -> Self {
        seq.0
    }
}

impl serde::Serialize for EventSeq {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EventSeq {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        i64::deserialize(deserializer).map(Self)
    }
}

// =============================================================================
// External Handles
// =============================================================================

/// Opaque handle issued by the hypervisor for a provisioned VM.
///
/// The engine never interprets the contents; it only requires the handle to
/// be non-empty printable text so it can be stored and logged safely.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExternalNodeId(String);

impl ExternalNodeId {
    /// Maximum accepted handle length in bytes.
    pub const MAX_LEN: usize = 255;

    pub fn parse(s: impl Into<String>) -> Result<Self, IdError> {
        let s = s.into();
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() > Self::MAX_LEN {
            return Err(IdError::InvalidHandle {
                message: format!("longer than {} bytes", Self::MAX_LEN),
            });
        }
        if s.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(IdError::InvalidHandle {
                message: "contains whitespace or control characters".to_string(),
            });
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExternalNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ExternalNodeId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for ExternalNodeId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ExternalNodeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_workspace_id_roundtrip() {
        let id = WorkspaceId::new();
        let parsed: WorkspaceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("ws_"));
    }

    #[test]
    fn test_node_id_rejects_workspace_prefix() {
        let ws = WorkspaceId::new().to_string();
        let err = ws.parse::<NodeId>().unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_missing_separator() {
        let result: Result<NodeId, _> = "node01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result.unwrap_err(), IdError::MissingSeparator));
    }

    #[test]
    fn test_empty() {
        let result: Result<AllocationId, _> = "".parse();
        assert!(result.unwrap_err().is_empty());
    }

    #[test]
    fn test_invalid_ulid() {
        let result: Result<NodeId, _> = "node_invalid".parse();
        assert!(matches!(result.unwrap_err(), IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_ids_serialize_as_prefixed_strings() {
        let id = NodeId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let parsed: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_node_ids_sort_by_creation() {
        let first = NodeId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = NodeId::new();
        assert!(first < second);
    }

    #[test]
    fn test_external_id_validation() {
        assert!(ExternalNodeId::parse("pve-node1/101").is_ok());
        assert!(ExternalNodeId::parse("").unwrap_err().is_empty());
        assert!(matches!(
            ExternalNodeId::parse("vm 101").unwrap_err(),
            IdError::InvalidHandle { .. }
        ));
        assert!(ExternalNodeId::parse("x".repeat(256)).is_err());
    }

    #[test]
    fn test_event_seq_ordering() {
        assert!(EventSeq::new(1) < EventSeq::new(2));
        let json = serde_json::to_string(&EventSeq::new(42)).unwrap();
        assert_eq!(json, "42");
    }

    #[test]
    fn test_prefixes_unique() {
        let prefixes = [
            WorkspaceId::PREFIX,
            AllocationId::PREFIX,
            NodeId::PREFIX,
            NodeEventId::PREFIX,
        ];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len());
    }

    proptest! {
        #[test]
        fn prop_external_id_display_roundtrip(s in "[A-Za-z0-9/:._-]{1,64}") {
            let id = ExternalNodeId::parse(s.clone()).unwrap();
            prop_assert_eq!(id.to_string(), s);
        }

        #[test]
        fn prop_node_id_from_ulid_roundtrip(n in any::<u128>()) {
            let id = NodeId::from_ulid(crate::Ulid(n));
            let parsed: NodeId = id.to_string().parse().unwrap();
            prop_assert_eq!(id, parsed);
        }
    }
}
