//! Session identity and on-disk layout.
//!
//! Each crossing session is identified by a UUID minted when the previous
//! session closes, and every stream's recording lands under a dated
//! directory derived from that id.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Opaque identifier for one crossing session.
///
/// Lowercase hyphenated UUID v4. The id is minted ahead of time: the
/// orchestrator holds the id of the *next* session so the media layer can
/// name files the moment recording starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Mint a fresh session id.
    pub fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Relative path for one stream's recording, computed at sink-creation
/// time from the local wall clock.
///
/// Layout:
/// `videos/{Y}/{m}/{d}/train_{id}/train_{id}_stream{index}_{Y-m-d_H-M-S}.mp4`.
/// Downstream indexing tools rely on this scheme, so it must not change
/// without coordination.
pub fn recording_path(session_id: &SessionId, stream_index: usize, at: DateTime<Local>) -> PathBuf {
    let day_dir = at.format("%Y/%m/%d");
    let stamp = at.format("%Y-%m-%d_%H-%M-%S");
    PathBuf::from(format!(
        "videos/{day_dir}/train_{id}/train_{id}_stream{stream_index}_{stamp}.mp4",
        id = session_id.as_str(),
    ))
}
