// Core domain types shared by the collaboration crates.
//
// Field names serialize in camelCase because rows travel through the managed
// backend that also serves the browser client.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a session is currently doing with a document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Viewing,
    Editing,
    Idle,
    Disconnected,
}

impl PresenceStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Viewing => "viewing",
            Self::Editing => "editing",
            Self::Idle => "idle",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown presence status `{0}`")]
pub struct ParseStatusError(pub String);

impl FromStr for PresenceStatus {
    type Err = ParseStatusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "viewing" => Ok(Self::Viewing),
            "editing" => Ok(Self::Editing),
            "idle" => Ok(Self::Idle),
            "disconnected" => Ok(Self::Disconnected),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Caret location inside the editor's text model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorPosition {
    pub line: u32,
    pub ch: u32,
}

/// Selection range (anchor, head). Collapsed selections are reported as `None`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionRange {
    pub anchor: CursorPosition,
    pub head: CursorPosition,
}

/// One row per active client session on a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    /// Issued by the store on creation.
    pub id: String,
    pub document_id: String,
    pub document_owner_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    /// Hex color derived once at join time.
    pub user_color: String,
    pub status: PresenceStatus,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_range: Option<SelectionRange>,
    /// Per-tab random id used to recognise our own echoes.
    pub session_id: String,
    pub joined_at: DateTime<Utc>,
}

impl UserPresence {
    /// A row is stale once `now - last_heartbeat` exceeds `timeout`.
    pub fn is_stale_at(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_heartbeat > timeout
    }

    /// Live rows are neither stale nor explicitly disconnected.
    pub fn is_live_at(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.status != PresenceStatus::Disconnected && !self.is_stale_at(now, timeout)
    }
}

/// Per-document version counter and advisory edit lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSyncState {
    pub document_id: String,
    /// Strictly increasing; bumped by exactly 1 per committed write.
    pub version: u64,
    pub last_modified_by: String,
    pub last_modified_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_expires_at: Option<DateTime<Utc>>,
}

impl DocumentSyncState {
    /// Returns the holder when a lock is set and its expiry is in the future.
    pub fn lock_holder_at(&self, now: DateTime<Utc>) -> Option<&str> {
        match (&self.locked_by, self.lock_expires_at) {
            (Some(holder), Some(expires_at)) if expires_at > now => Some(holder.as_str()),
            _ => None,
        }
    }

    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.lock_holder_at(now).is_some()
    }
}
