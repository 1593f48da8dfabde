//! Event records shared between the firewall monitor and the tools that read its log.
//!
//! One [`Event`] is one line of the event log (NDJSON). The same shape is used for the
//! blocked-entity side file consumed by the reconciliation tooling, so anything that reads
//! or writes either file goes through these types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A durable record describing one firewall decision or noteworthy packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Address of the peer the event is about (usually the packet source).
    pub ip: String,
    /// Port the peer targeted.
    pub port: u16,
    /// Free-text classification, e.g. "Deny ip" or "Synapse observed".
    pub reason: String,
    #[serde(default)]
    pub metadata: EventMetadata,
}

/// Nested key/value data describing where the event came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synapse: Option<SynapseMetadata>,
    /// Any other keys found on the record are kept as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Identity of the peer that sent the request, as announced in its headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynapseMetadata {
    pub hotkey: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    pub fn new(ip: impl Into<String>, port: u16, reason: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port,
            reason: reason.into(),
            metadata: EventMetadata::default(),
        }
    }

    /// Attach the sender's hotkey under `metadata.synapse`.
    pub fn with_synapse(mut self, synapse: SynapseMetadata) -> Self {
        self.metadata.synapse = Some(synapse);
        self
    }

    /// Hotkey of the sender, when the event carries one.
    pub fn hotkey(&self) -> Option<&str> {
        self.metadata.synapse.as_ref().map(|s| s.hotkey.as_str())
    }

    /// Serialize as a single log line, without the trailing newline.
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

impl SynapseMetadata {
    pub fn new(hotkey: impl Into<String>) -> Self {
        Self {
            hotkey: hotkey.into(),
            extra: Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Parse every non-blank line of an NDJSON document into events.
///
/// Stops at the first line that is not a valid event and reports its 1-based line number.
pub fn parse_events(content: &str) -> Result<Vec<Event>, (usize, serde_json::Error)> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| Event::from_line(line).map_err(|e| (idx + 1, e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_matches_log_schema() {
        let event = Event::new("10.0.0.1", 8091, "Deny ip")
            .with_synapse(SynapseMetadata::new("5F3sa2").with("name", "Score"));
        let value: Value = serde_json::from_str(&event.to_line().unwrap()).unwrap();

        assert_eq!(value["ip"], "10.0.0.1");
        assert_eq!(value["port"], 8091);
        assert_eq!(value["reason"], "Deny ip");
        assert_eq!(value["metadata"]["synapse"]["hotkey"], "5F3sa2");
        assert_eq!(value["metadata"]["synapse"]["name"], "Score");
    }

    #[test]
    fn test_synapse_is_omitted_when_absent() {
        let line = Event::new("10.0.0.1", 22, "Deny port").to_line().unwrap();
        assert_eq!(
            line,
            r#"{"ip":"10.0.0.1","port":22,"reason":"Deny port","metadata":{}}"#
        );
    }

    #[test]
    fn test_unknown_metadata_keys_are_kept() {
        let line = r#"{"ip":"1.2.3.4","port":80,"reason":"r","metadata":{"rule":"deny","synapse":{"hotkey":"hk","uuid":"u1"}}}"#;
        let event = Event::from_line(line).unwrap();

        assert_eq!(event.hotkey(), Some("hk"));
        assert_eq!(event.metadata.extra["rule"], "deny");
        assert_eq!(event.metadata.synapse.unwrap().extra["uuid"], "u1");
    }

    #[test]
    fn test_parse_events_skips_blank_lines() {
        let content = "{\"ip\":\"1.1.1.1\",\"port\":1,\"reason\":\"a\"}\n\n   \n{\"ip\":\"2.2.2.2\",\"port\":2,\"reason\":\"b\"}\n";
        let events = parse_events(content).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].ip, "2.2.2.2");
        assert!(events[0].metadata.synapse.is_none());
    }

    #[test]
    fn test_parse_events_reports_bad_line() {
        let content = "{\"ip\":\"1.1.1.1\",\"port\":1,\"reason\":\"a\"}\nnot json\n";
        let (line, _) = parse_events(content).unwrap_err();
        assert_eq!(line, 2);
    }
}
