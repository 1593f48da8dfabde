use serde::Serialize;
use serde_json::{Map, Value};

use fwmon_common::SynapseMetadata;

const HEADER_PREFIX: &str = "bt_header_";

/// Identity a peer announces in the request it sends through the queue.
///
/// Requests arrive either as a JSON document or as an HTTP request whose headers (or JSON body)
/// carry the synapse name plus axon and dendrite details. Every field is optional because
/// a single TCP segment rarely carries the full request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SynapseIdentity {
    pub name: Option<String>,
    pub axon_ip: Option<String>,
    pub axon_port: Option<String>,
    pub axon_hotkey: Option<String>,
    pub dendrite_ip: Option<String>,
    pub dendrite_port: Option<String>,
    pub dendrite_version: Option<String>,
    pub dendrite_nonce: Option<String>,
    pub dendrite_uuid: Option<String>,
    pub dendrite_hotkey: Option<String>,
    pub dendrite_signature: Option<String>,
    pub computed_body_hash: Option<String>,
}

impl SynapseIdentity {
    /// Extract the identity from a transport payload.
    ///
    /// Returns `None` when the payload is not UTF-8 or carries none of the known keys.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        let content = std::str::from_utf8(payload).ok()?;
        if content.trim().is_empty() {
            return None;
        }

        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(content) {
            return Self::from_map(&map);
        }

        let map = match content.split_once("\r\n\r\n") {
            Some((head, body)) if head.contains("Content-Type: application/json") => {
                match serde_json::from_str::<Value>(body) {
                    Ok(Value::Object(map)) => map,
                    _ => parse_headers(content),
                }
            }
            _ => parse_headers(content),
        };

        Self::from_map(&map)
    }

    fn from_map(map: &Map<String, Value>) -> Option<Self> {
        let field = |flat: &str, nested: &str| lookup(map, flat).or_else(|| lookup(map, nested));
        let identity = Self {
            name: lookup(map, "name"),
            axon_ip: field("axon_ip", "axon.ip"),
            axon_port: field("axon_port", "axon.port"),
            axon_hotkey: field("axon_hotkey", "axon.hotkey"),
            dendrite_ip: field("dendrite_ip", "dendrite.ip"),
            dendrite_port: field("dendrite_port", "dendrite.port"),
            dendrite_version: field("dendrite_version", "dendrite.version"),
            dendrite_nonce: field("dendrite_nonce", "dendrite.nonce"),
            dendrite_uuid: field("dendrite_uuid", "dendrite.uuid"),
            dendrite_hotkey: field("dendrite_hotkey", "dendrite.hotkey"),
            dendrite_signature: field("dendrite_signature", "dendrite.signature"),
            computed_body_hash: lookup(map, "computed_body_hash"),
        };

        (identity != Self::default()).then_some(identity)
    }

    /// The hotkey that identifies the sender.
    pub fn hotkey(&self) -> Option<&str> {
        self.dendrite_hotkey.as_deref()
    }

    /// Event metadata for this identity, or `None` without a sender hotkey.
    pub fn to_metadata(&self) -> Option<SynapseMetadata> {
        let hotkey = self.dendrite_hotkey.clone()?;
        let mut metadata = SynapseMetadata::new(hotkey);
        let extras = [
            ("name", &self.name),
            ("uuid", &self.dendrite_uuid),
            ("nonce", &self.dendrite_nonce),
            ("version", &self.dendrite_version),
            ("axon_hotkey", &self.axon_hotkey),
        ];
        for (key, value) in extras {
            if let Some(value) = value {
                metadata = metadata.with(key, value.clone());
            }
        }
        Some(metadata)
    }
}

/// Resolve a dotted path (`dendrite.hotkey`) in a JSON object and render it as a string.
fn lookup(map: &Map<String, Value>, path: &str) -> Option<String> {
    let mut parts = path.split('.');
    let mut current = map.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }

    match current {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Collect `Key: value` lines of an HTTP request head, skipping the request/status line.
fn parse_headers(content: &str) -> Map<String, Value> {
    let head = content.split("\r\n\r\n").next().unwrap_or(content);
    let mut headers = Map::new();

    for line in head.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty()
            || line.starts_with("POST")
            || line.starts_with("GET")
            || line.starts_with("HTTP")
        {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            let key = key.strip_prefix(HEADER_PREFIX).unwrap_or(key);
            headers.insert(key.to_string(), Value::String(value.trim().to_string()));
        }
    }

    headers
}
