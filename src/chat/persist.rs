/// Chat session persistence.
///
/// UTF-8 JSON with a schema version, written atomically (temp file in the
/// same directory, then rename). Version 1 files predate usage accounting
/// and migrate in memory; anything newer than the current version is
/// refused with `SchemaUnsupported`.
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::chat::message::{ChatMessage, Usage};
use crate::error::{QuernError, QuernResult};

pub const SESSION_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    pub schema_version: u32,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Absent in schema version 1; defaults on migration.
    #[serde(default)]
    pub usage: Usage,
}

pub fn save_session_file(path: &Path, session: &PersistedSession) -> QuernResult<()> {
    let json = serde_json::to_vec_pretty(session)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn load_session_file(path: &Path) -> QuernResult<PersistedSession> {
    let bytes = std::fs::read(path)?;
    // peek the version before committing to the full shape
    let probe: serde_json::Value = serde_json::from_slice(&bytes)?;
    let version = probe
        .get("schema_version")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| QuernError::Corrupt("session file has no schema_version".to_string()))?
        as u32;
    if version > SESSION_SCHEMA_VERSION {
        return Err(QuernError::SchemaUnsupported(version));
    }

    let mut session: PersistedSession = serde_json::from_slice(&bytes)?;
    if version < SESSION_SCHEMA_VERSION {
        tracing::info!(
            from = version,
            to = SESSION_SCHEMA_VERSION,
            "migrating persisted session in memory"
        );
        session.schema_version = SESSION_SCHEMA_VERSION;
    }
    Ok(session)
}
