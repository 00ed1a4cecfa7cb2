//! Persisted session credentials
//!
//! The session lives in one JSON document on disk. The canonical key holds
//! `{tokens, identity, isLoggedIn}`; unrelated keys sharing the document are
//! carried along untouched. All writes go through a tokio Mutex and an atomic
//! temp-file + rename, and in-memory state is only committed after the file
//! write succeeds. A reader therefore sees either the old pair or the new
//! pair, and a logout either removes everything or nothing.
//!
//! The store also carries a session epoch. Login and logout bump it; a
//! refresh must present the epoch it started under, so a refresh that loses
//! a race against logout (or a fresh login) is discarded.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::constants::SESSION_KEY;
use crate::error::{Error, Result};
use crate::expiry::{Expiry, is_time_valid};

/// The current access/refresh credentials. Replaced as a whole, never patched.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_expires_at: Option<Expiry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_expires_at: Option<Expiry>,
}

impl TokenPair {
    pub fn is_access_valid(&self, now: DateTime<Utc>) -> bool {
        is_time_valid(self.access_expires_at.as_ref(), now)
    }

    pub fn is_refresh_valid(&self, now: DateTime<Utc>) -> bool {
        is_time_valid(self.refresh_expires_at.as_ref(), now)
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .finish()
    }
}

/// Who is logged in. Attached at login, cleared at logout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(alias = "user_id", alias = "id", deserialize_with = "string_or_number")]
    pub user_id: String,
    #[serde(
        default,
        alias = "tenant_id",
        deserialize_with = "opt_string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(
        default,
        alias = "display_name",
        alias = "name",
        skip_serializing_if = "Option::is_none"
    )]
    pub display_name: Option<String>,
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn opt_string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// Value stored under `SESSION_KEY`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tokens: Option<TokenPair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    identity: Option<Identity>,
    /// Explicit flag; `None` means derive from tokens + identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    is_logged_in: Option<bool>,
}

impl SessionRecord {
    fn is_empty(&self) -> bool {
        self.tokens.is_none() && self.identity.is_none() && self.is_logged_in.is_none()
    }

    fn logged_in(&self) -> bool {
        self.is_logged_in
            .unwrap_or(self.tokens.is_some() && self.identity.is_some())
    }
}

/// Flat layout written by older clients, one field per key.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyRecord {
    #[serde(default, alias = "access_token", alias = "token")]
    access_token: Option<String>,
    #[serde(default, alias = "refresh_token")]
    refresh_token: Option<String>,
    #[serde(default, alias = "access_expires_at", alias = "tokenExpiry", alias = "expiresAt")]
    access_expires_at: Option<Expiry>,
    #[serde(default, alias = "refresh_expires_at", alias = "refreshTokenExpiry")]
    refresh_expires_at: Option<Expiry>,
    #[serde(default, alias = "user")]
    identity: Option<Identity>,
    #[serde(default, alias = "is_logged_in")]
    is_logged_in: Option<bool>,
}

fn parse_legacy(value: &Value) -> Option<SessionRecord> {
    if let Ok(record) = serde_json::from_value::<SessionRecord>(value.clone())
        && record.tokens.is_some()
    {
        return Some(record);
    }

    let legacy: LegacyRecord = serde_json::from_value(value.clone()).ok()?;
    let tokens = TokenPair {
        access_token: legacy.access_token?,
        refresh_token: legacy.refresh_token?,
        access_expires_at: legacy.access_expires_at,
        refresh_expires_at: legacy.refresh_expires_at,
    };
    Some(SessionRecord {
        tokens: Some(tokens),
        identity: legacy.identity,
        is_logged_in: legacy.is_logged_in,
    })
}

/// Token-free view of the session for status endpoints and logs.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub logged_in: bool,
    pub identity: Option<Identity>,
    pub access_expires_at: Option<Expiry>,
    pub refresh_expires_at: Option<Expiry>,
    pub access_valid: bool,
    pub refresh_valid: bool,
    pub epoch: u64,
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    /// Keys in the document that are not ours
    extra: Map<String, Value>,
    record: SessionRecord,
    epoch: u64,
}

impl StoreState {
    fn document(&self) -> Result<Map<String, Value>> {
        let mut document = self.extra.clone();
        if !self.record.is_empty() {
            let value = serde_json::to_value(&self.record)
                .map_err(|e| Error::CredentialParse(format!("serializing session: {e}")))?;
            document.insert(SESSION_KEY.to_string(), value);
        }
        Ok(document)
    }
}

/// Process-wide session credential store backed by a JSON file.
pub struct CredentialStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl CredentialStore {
    /// Load the session document from `path`.
    ///
    /// A missing file starts an empty (logged-out) store and creates the
    /// file. When the canonical key is absent, `legacy_keys` are tried in
    /// order and the first one holding a usable session is adopted. Every
    /// legacy key is removed afterwards, so migration runs at most once.
    pub async fn load<S: AsRef<str>>(path: PathBuf, legacy_keys: &[S]) -> Result<Self> {
        let (state, dirty) = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading session file: {e}")))?;
            let document: Map<String, Value> = if contents.trim().is_empty() {
                Map::new()
            } else {
                serde_json::from_str(&contents)
                    .map_err(|e| Error::CredentialParse(format!("parsing session file: {e}")))?
            };
            resolve(document, legacy_keys)?
        } else {
            info!(path = %path.display(), "session file not found, starting logged out");
            (StoreState::default(), true)
        };

        if dirty {
            write_atomic(&path, &state.document()?).await?;
        }

        info!(
            path = %path.display(),
            logged_in = state.record.logged_in(),
            "loaded session"
        );

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the current in-memory state to disk.
    pub async fn save(&self) -> Result<()> {
        let state = self.state.lock().await;
        write_atomic(&self.path, &state.document()?).await
    }

    /// Clone of the current token pair.
    pub async fn get(&self) -> Option<TokenPair> {
        let state = self.state.lock().await;
        state.record.tokens.clone()
    }

    /// Current pair together with the epoch it belongs to.
    pub async fn tokens_with_epoch(&self) -> (Option<TokenPair>, u64) {
        let state = self.state.lock().await;
        (state.record.tokens.clone(), state.epoch)
    }

    pub async fn identity(&self) -> Option<Identity> {
        let state = self.state.lock().await;
        state.record.identity.clone()
    }

    pub async fn epoch(&self) -> u64 {
        self.state.lock().await.epoch
    }

    /// Store a fresh login. Starts a new epoch and returns it.
    pub async fn set(&self, tokens: TokenPair, identity: Identity) -> Result<u64> {
        let mut state = self.state.lock().await;
        let next = StoreState {
            extra: state.extra.clone(),
            record: SessionRecord {
                tokens: Some(tokens),
                identity: Some(identity),
                is_logged_in: Some(true),
            },
            epoch: state.epoch + 1,
        };
        write_atomic(&self.path, &next.document()?).await?;
        *state = next;
        debug!(epoch = state.epoch, "stored new session");
        Ok(state.epoch)
    }

    /// Swap in a refreshed pair if the session is still the one the refresh
    /// started under.
    ///
    /// Returns `false` without writing when the store was cleared or a new
    /// login happened in the meantime.
    pub async fn replace_tokens(&self, expected_epoch: u64, tokens: TokenPair) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.epoch != expected_epoch || state.record.tokens.is_none() {
            debug!(
                expected_epoch,
                current_epoch = state.epoch,
                "discarding refreshed tokens, session changed underneath"
            );
            return Ok(false);
        }
        let mut next = state.clone();
        next.record.tokens = Some(tokens);
        write_atomic(&self.path, &next.document()?).await?;
        *state = next;
        debug!(epoch = state.epoch, "replaced token pair");
        Ok(true)
    }

    /// Remove tokens, identity and the logged-in flag in one write.
    ///
    /// Returns `false` (and writes nothing) if the store was already empty.
    pub async fn clear(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.record.is_empty() {
            return Ok(false);
        }
        let next = StoreState {
            extra: state.extra.clone(),
            record: SessionRecord::default(),
            epoch: state.epoch + 1,
        };
        write_atomic(&self.path, &next.document()?).await?;
        *state = next;
        info!(epoch = state.epoch, "session cleared");
        Ok(true)
    }

    /// `clear`, but only while the store is still on `expected_epoch`.
    ///
    /// Used when a failed refresh ends the session: a login that landed
    /// while the refresh was in flight must survive.
    pub async fn clear_if(&self, expected_epoch: u64) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.epoch != expected_epoch || state.record.is_empty() {
            return Ok(false);
        }
        let next = StoreState {
            extra: state.extra.clone(),
            record: SessionRecord::default(),
            epoch: state.epoch + 1,
        };
        write_atomic(&self.path, &next.document()?).await?;
        *state = next;
        info!(epoch = state.epoch, "session cleared after refresh failure");
        Ok(true)
    }

    /// Pin the logged-in flag regardless of what tokens are present.
    pub async fn set_logged_in(&self, logged_in: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.record.is_logged_in = Some(logged_in);
        write_atomic(&self.path, &next.document()?).await?;
        *state = next;
        Ok(())
    }

    pub async fn is_logged_in(&self) -> bool {
        self.state.lock().await.record.logged_in()
    }

    /// False when there is no token at all; true when the stored expiry is in
    /// the future, absent, or unreadable.
    pub async fn is_access_valid(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock().await;
        state
            .record
            .tokens
            .as_ref()
            .is_some_and(|t| t.is_access_valid(now))
    }

    pub async fn is_refresh_valid(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock().await;
        state
            .record
            .tokens
            .as_ref()
            .is_some_and(|t| t.is_refresh_valid(now))
    }

    pub async fn summary(&self, now: DateTime<Utc>) -> SessionSummary {
        let state = self.state.lock().await;
        let tokens = state.record.tokens.as_ref();
        SessionSummary {
            logged_in: state.record.logged_in(),
            identity: state.record.identity.clone(),
            access_expires_at: tokens.and_then(|t| t.access_expires_at.clone()),
            refresh_expires_at: tokens.and_then(|t| t.refresh_expires_at.clone()),
            access_valid: tokens.is_some_and(|t| t.is_access_valid(now)),
            refresh_valid: tokens.is_some_and(|t| t.is_refresh_valid(now)),
            epoch: state.epoch,
        }
    }
}

/// Split a loaded document into our record and everything else, migrating
/// legacy keys. The bool reports whether the document needs rewriting.
fn resolve<S: AsRef<str>>(
    mut document: Map<String, Value>,
    legacy_keys: &[S],
) -> Result<(StoreState, bool)> {
    let record = match document.remove(SESSION_KEY) {
        Some(value) => serde_json::from_value(value)
            .map_err(|e| Error::CredentialParse(format!("parsing session record: {e}")))?,
        None => legacy_keys
            .iter()
            .find_map(|key| {
                let key = key.as_ref();
                let record = document.get(key).and_then(parse_legacy)?;
                info!(legacy_key = key, "migrating session from legacy key");
                Some(record)
            })
            .unwrap_or_default(),
    };

    let mut dirty = false;
    for key in legacy_keys {
        if document.remove(key.as_ref()).is_some() {
            dirty = true;
        }
    }
    if dirty && record.is_empty() {
        warn!("legacy session keys present but none held a usable session, dropping them");
    }

    Ok((
        StoreState {
            extra: document,
            record,
            epoch: 0,
        },
        dirty,
    ))
}

/// Write the session document atomically.
///
/// Writes a temporary file next to the target and renames it over, so a
/// crash mid-write leaves either the old document or the new one. File mode
/// is 0600 on unix since the document holds bearer tokens.
async fn write_atomic(path: &Path, document: &Map<String, Value>) -> Result<()> {
    let json = serde_json::to_string_pretty(document)
        .map_err(|e| Error::CredentialParse(format!("serializing session file: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("session path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".session.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp session file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting session file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp session file: {e}")))?;

    debug!(path = %path.display(), "persisted session");
    Ok(())
}
