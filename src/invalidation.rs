//! Cross-process invalidation messages and the bus that carries them
//!
//! Channels are named `<app>.<domain>.<op>` and carry JSON payloads
//! identifying the publishing process, so every receiver can drop its own
//! echoes.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::CacheError;

/// Identity of the process that published a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    pub hostname: String,
    pub pid: u32,
}

impl Origin {
    pub fn new(hostname: impl Into<String>, pid: u32) -> Self {
        Self {
            hostname: hostname.into(),
            pid,
        }
    }

    /// Hostname and pid of the running process.
    pub fn current() -> Self {
        Self {
            hostname: local_hostname(),
            pid: std::process::id(),
        }
    }
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.pid)
    }
}

/// Mutation a message announces; the last segment of the channel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationOp {
    Set,
    Remove,
    Mset,
    Flush,
}

impl InvalidationOp {
    pub fn as_str(self) -> &'static str {
        match self {
            InvalidationOp::Set => "set",
            InvalidationOp::Remove => "remove",
            InvalidationOp::Mset => "mset",
            InvalidationOp::Flush => "flush",
        }
    }
}

impl FromStr for InvalidationOp {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "set" => Ok(InvalidationOp::Set),
            "remove" => Ok(InvalidationOp::Remove),
            "mset" => Ok(InvalidationOp::Mset),
            "flush" => Ok(InvalidationOp::Flush),
            other => Err(CacheError::Bus(format!("unknown invalidation op '{other}'"))),
        }
    }
}

/// Channel names for one application and cache domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channels {
    prefix: String,
}

impl Channels {
    pub fn new(app_name: &str, domain: &str) -> Self {
        Self {
            prefix: format!("{app_name}.{domain}"),
        }
    }

    pub fn channel(&self, op: InvalidationOp) -> String {
        format!("{}.{}", self.prefix, op.as_str())
    }

    /// Pattern matching every channel of this domain.
    pub fn pattern(&self) -> String {
        format!("{}.*", self.prefix)
    }

    pub fn op_of(&self, channel: &str) -> Option<InvalidationOp> {
        channel
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('.')?
            .parse()
            .ok()
    }
}

/// Payload published after a coordinated tier changes its local copy.
///
/// Single-key operations fill `key` (and `value` for sets); batch operations
/// fill `keys` (and `values` for msets). Values are fingerprints of the
/// stored envelope, never the envelope itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    #[serde(flatten)]
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
    #[serde(rename = "value", default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(rename = "values", default, skip_serializing_if = "Option::is_none")]
    pub fingerprints: Option<HashMap<String, String>>,
}

impl InvalidationMessage {
    fn empty(origin: Origin) -> Self {
        Self {
            origin,
            key: None,
            keys: None,
            fingerprint: None,
            fingerprints: None,
        }
    }

    pub fn set(origin: Origin, key: &str, fingerprint: String) -> Self {
        Self {
            key: Some(key.to_owned()),
            fingerprint: Some(fingerprint),
            ..Self::empty(origin)
        }
    }

    pub fn remove(origin: Origin, key: &str) -> Self {
        Self {
            key: Some(key.to_owned()),
            ..Self::empty(origin)
        }
    }

    pub fn mset(origin: Origin, fingerprints: HashMap<String, String>) -> Self {
        Self {
            keys: Some(fingerprints.keys().cloned().collect()),
            fingerprints: Some(fingerprints),
            ..Self::empty(origin)
        }
    }

    pub fn flush(origin: Origin) -> Self {
        Self::empty(origin)
    }

    /// Every key this message names.
    pub fn affected_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.key.iter().map(String::as_str).collect();
        if let Some(batch) = &self.keys {
            keys.extend(batch.iter().map(String::as_str));
        }
        keys
    }
}

/// Stable digest of a stored envelope, used to compare copies across
/// processes without shipping the value.
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// What a subscription yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Message(BusMessage),
    /// Messages may have been lost (a lagging receiver or a reconnect).
    /// Anything cached on the strength of earlier messages is suspect.
    Gap,
}

/// Stream of events matching a subscription pattern. Dropping it ends the
/// subscription.
pub type Subscription = mpsc::UnboundedReceiver<BusEvent>;

/// Publish/subscribe transport used by coordinated tiers.
///
/// Implementations must deliver subscriptions on a connection that is not
/// used for publishing.
#[async_trait]
pub trait InvalidationBus: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), CacheError>;

    /// Subscribe to every channel matching `pattern` (a trailing `*` matches
    /// any suffix).
    async fn subscribe(&self, pattern: &str) -> Result<Subscription, CacheError>;
}

pub(crate) fn channel_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

/// In-process bus. Every clone shares the same broadcast channel, so several
/// coordinated tiers holding clones behave like separate processes attached
/// to one broker.
#[derive(Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<BusMessage>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InvalidationBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), CacheError> {
        // no subscribers is not an error for a broker
        let _ = self.tx.send(BusMessage {
            channel: channel.to_owned(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, CacheError> {
        let mut source = self.tx.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let pattern = pattern.to_owned();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    received = source.recv() => match received {
                        Ok(msg) => {
                            if channel_matches(&pattern, &msg.channel)
                                && tx.send(BusEvent::Message(msg)).is_err()
                            {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(pattern = %pattern, skipped, "MemoryBus: subscriber lagged; invalidations dropped");
                            if tx.send(BusEvent::Gap).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!(pattern = %pattern, "MemoryBus: subscription closed");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        let channels = Channels::new("billing", "global_runtime");
        assert_eq!(
            channels.channel(InvalidationOp::Set),
            "billing.global_runtime.set"
        );
        assert_eq!(channels.pattern(), "billing.global_runtime.*");
        assert_eq!(
            channels.op_of("billing.global_runtime.flush"),
            Some(InvalidationOp::Flush)
        );
        assert_eq!(channels.op_of("billing.global_runtime.bogus"), None);
        assert_eq!(channels.op_of("other.global_runtime.set"), None);
        assert_eq!(channels.op_of("billing.global_runtimeX.set"), None);
    }

    #[test]
    fn test_set_message_wire_format() {
        let msg = InvalidationMessage::set(Origin::new("web-1", 42), "user:1", "abc".to_owned());
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"hostname": "web-1", "pid": 42, "key": "user:1", "value": "abc"})
        );

        let parsed: InvalidationMessage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_batch_message_wire_format() {
        let mut fps = HashMap::new();
        fps.insert("a".to_owned(), "fa".to_owned());
        let msg = InvalidationMessage::mset(Origin::new("web-1", 42), fps);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["keys"], serde_json::json!(["a"]));
        assert_eq!(json["values"]["a"], "fa");
        assert!(json.get("key").is_none());

        // foreign publishers may omit fingerprints
        let parsed: InvalidationMessage =
            serde_json::from_str(r#"{"hostname":"h","pid":1,"keys":["x","y"]}"#).unwrap();
        assert_eq!(parsed.affected_keys(), vec!["x", "y"]);
        assert!(parsed.fingerprints.is_none());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(fingerprint(b"abc"), fingerprint(b"abc"));
        assert_ne!(fingerprint(b"abc"), fingerprint(b"abd"));
        assert_eq!(fingerprint(b"").len(), 64);
    }

    #[test]
    fn test_channel_matches() {
        assert!(channel_matches("app.d.*", "app.d.set"));
        assert!(!channel_matches("app.d.*", "app.e.set"));
        assert!(channel_matches("app.d.set", "app.d.set"));
        assert!(!channel_matches("app.d.set", "app.d.remove"));
    }

    #[tokio::test]
    async fn test_memory_bus_delivers_matching_channels() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("app.d.*").await.unwrap();

        bus.publish("other.d.set", "skip".to_owned()).await.unwrap();
        bus.publish("app.d.set", "hello".to_owned()).await.unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(
            event,
            BusEvent::Message(BusMessage {
                channel: "app.d.set".to_owned(),
                payload: "hello".to_owned(),
            })
        );
    }

    #[tokio::test]
    async fn test_memory_bus_clones_share_broker() {
        let bus = MemoryBus::new();
        let other = bus.clone();
        let mut sub = other.subscribe("*").await.unwrap();

        bus.publish("x", "1".to_owned()).await.unwrap();
        assert!(matches!(
            sub.recv().await.unwrap(),
            BusEvent::Message(msg) if msg.payload == "1"
        ));
    }

    #[tokio::test]
    async fn test_memory_bus_reports_lag_as_gap() {
        let bus = MemoryBus::with_capacity(4);
        let mut sub = bus.subscribe("app.d.*").await.unwrap();

        for i in 0..10 {
            bus.publish("app.d.set", i.to_string()).await.unwrap();
        }

        assert_eq!(sub.recv().await.unwrap(), BusEvent::Gap);
        let mut delivered = Vec::new();
        for _ in 0..4 {
            match sub.recv().await.unwrap() {
                BusEvent::Message(msg) => delivered.push(msg.payload),
                BusEvent::Gap => panic!("only one gap expected"),
            }
        }
        assert_eq!(delivered, vec!["6", "7", "8", "9"]);
    }
}
