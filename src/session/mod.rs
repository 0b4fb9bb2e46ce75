//! Sessions - durable client identities shared by connections.
//!
//! A [`Session`] is created by the server on behalf of a connection, announced
//! to the client as a JSON object and kept in the [`SessionRegistry`] for as
//! long as at least one connection references it. A [`SessionManager`] sees
//! every creation, lookup and destruction and can keep sessions restorable
//! after their last connection went away.
//!
//! # JSON form
//!
//! ```text
//! {"key":"…","creation":"2024-01-01T00:00:00Z","lastLookup":"…","info":{…}}
//! ```

pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::server::Connection;

pub use registry::{Deregistration, SessionRegistry};

/// Number of random bytes in a generated session key.
pub const SESSION_KEY_BYTES: usize = 48;

/// Application data attached to a session.
///
/// Implementations expose their fields by name so the server can serialize
/// them without knowing the concrete type.
pub trait SessionInfo: Send + Sync + std::fmt::Debug {
    /// Names of all fields.
    fn fields(&self) -> Vec<String>;

    /// Value of a field, if present.
    fn value(&self, field: &str) -> Option<Value>;

    /// All fields as a JSON object.
    fn to_json(&self) -> Map<String, Value> {
        self.fields()
            .into_iter()
            .filter_map(|field| self.value(&field).map(|value| (field, value)))
            .collect()
    }
}

/// Session info backed by a JSON object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JsonSessionInfo(pub Map<String, Value>);

impl SessionInfo for JsonSessionInfo {
    fn fields(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    fn value(&self, field: &str) -> Option<Value> {
        self.0.get(field).cloned()
    }

    fn to_json(&self) -> Map<String, Value> {
        self.0.clone()
    }
}

impl From<Map<String, Value>> for JsonSessionInfo {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// A session. Cloned before it is handed out, never shared mutably.
#[derive(Clone)]
pub struct Session {
    /// Unique session key.
    pub key: String,
    /// When the session was created.
    pub creation: DateTime<Utc>,
    /// When the session was last looked up for restoration.
    pub last_lookup: DateTime<Utc>,
    /// Application data.
    pub info: Option<Arc<dyn SessionInfo>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncodedSession {
    key: String,
    creation: DateTime<Utc>,
    last_lookup: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    info: Option<Map<String, Value>>,
}

impl Session {
    /// Create a session with the given key, stamped now.
    pub fn new(key: impl Into<String>, info: Option<Arc<dyn SessionInfo>>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            creation: now,
            last_lookup: now,
            info,
        }
    }

    /// Look up a single info field.
    pub fn info_value(&self, field: &str) -> Option<Value> {
        self.info.as_ref().and_then(|info| info.value(field))
    }

    /// Encode as the JSON object sent to clients.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let encoded = EncodedSession {
            key: self.key.clone(),
            creation: self.creation,
            last_lookup: self.last_lookup,
            info: self.info.as_ref().map(|info| info.to_json()),
        };
        Ok(serde_json::to_vec(&encoded)?)
    }

    /// Decode the JSON object sent by the server.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let encoded: EncodedSession = serde_json::from_slice(data)?;
        Ok(Self {
            key: encoded.key,
            creation: encoded.creation,
            last_lookup: encoded.last_lookup,
            info: encoded
                .info
                .map(|map| Arc::new(JsonSessionInfo(map)) as Arc<dyn SessionInfo>),
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("creation", &self.creation)
            .field("last_lookup", &self.last_lookup)
            .field("info", &self.info)
            .finish()
    }
}

/// Produces unique session keys.
pub trait SessionKeyGenerator: Send + Sync + 'static {
    /// Generate a new key.
    fn generate(&self) -> String;
}

/// Default generator: 48 random bytes, URL-safe base64 without padding.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomKeyGenerator;

impl SessionKeyGenerator for RandomKeyGenerator {
    fn generate(&self) -> String {
        let mut bytes = [0u8; SESSION_KEY_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }
}

/// Hooks observing the session lifecycle.
///
/// Errors from `on_session_created` and `on_session_closed` are logged and do
/// not undo the operation that triggered them.
#[async_trait]
pub trait SessionManager: Send + Sync + 'static {
    /// A session was created on `conn`.
    async fn on_session_created(&self, conn: &Connection) -> Result<()>;

    /// A client asked to restore `key`. Returns `None` if the key is unknown.
    async fn on_session_lookup(&self, key: &str) -> Result<Option<Session>>;

    /// The session `key` was destroyed and must not be restorable anymore.
    async fn on_session_closed(&self, key: &str) -> Result<()>;
}

/// Keeps sessions in process memory until they are destroyed.
#[derive(Debug, Default)]
pub struct MemorySessionManager {
    sessions: Mutex<HashMap<String, Session>>,
}

impl MemorySessionManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Check if no session is stored.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Store a session directly.
    pub fn insert(&self, session: Session) {
        self.sessions.lock().insert(session.key.clone(), session);
    }
}

#[async_trait]
impl SessionManager for MemorySessionManager {
    async fn on_session_created(&self, conn: &Connection) -> Result<()> {
        if let Some(session) = conn.session() {
            self.insert(session);
        }
        Ok(())
    }

    async fn on_session_lookup(&self, key: &str) -> Result<Option<Session>> {
        let mut sessions = self.sessions.lock();
        Ok(sessions.get_mut(key).map(|session| {
            session.last_lookup = Utc::now();
            session.clone()
        }))
    }

    async fn on_session_closed(&self, key: &str) -> Result<()> {
        self.sessions.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn info(name: &str) -> Arc<dyn SessionInfo> {
        let mut map = Map::new();
        map.insert("username".to_string(), json!(name));
        Arc::new(JsonSessionInfo(map))
    }

    #[test]
    fn test_random_keys_are_unique_and_url_safe() {
        let gen = RandomKeyGenerator;
        let a = gen.generate();
        let b = gen.generate();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_json_field_names() {
        let session = Session::new("k1", Some(info("alice")));
        let json: Value = serde_json::from_slice(&session.to_json().unwrap()).unwrap();
        assert_eq!(json["key"], "k1");
        assert!(json.get("lastLookup").is_some());
        assert!(json.get("creation").is_some());
        assert_eq!(json["info"]["username"], "alice");
    }

    #[test]
    fn test_json_without_info_omits_field() {
        let session = Session::new("k2", None);
        let json: Value = serde_json::from_slice(&session.to_json().unwrap()).unwrap();
        assert!(json.get("info").is_none());
    }

    #[test]
    fn test_from_json_restores_info() {
        let session = Session::new("k3", Some(info("bob")));
        let decoded = Session::from_json(&session.to_json().unwrap()).unwrap();
        assert_eq!(decoded.key, "k3");
        assert_eq!(decoded.creation, session.creation);
        assert_eq!(decoded.info_value("username"), Some(json!("bob")));
        assert_eq!(decoded.info_value("missing"), None);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            Session::from_json(b"not json"),
            Err(crate::error::WireError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_manager_lookup_and_close() {
        let manager = MemorySessionManager::new();
        let session = Session::new("k4", None);
        let created = session.last_lookup;
        manager.insert(session);

        let found = manager.on_session_lookup("k4").await.unwrap().unwrap();
        assert!(found.last_lookup >= created);
        assert!(manager.on_session_lookup("nope").await.unwrap().is_none());

        manager.on_session_closed("k4").await.unwrap();
        assert!(manager.is_empty());
    }
}
