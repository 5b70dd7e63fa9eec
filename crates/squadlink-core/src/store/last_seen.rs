use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::constants::LAST_SEEN_FILE;
use crate::models::{ConversationKey, Message};

#[derive(Debug, thiserror::Error)]
pub enum LastSeenError {
    #[error("Failed to read last-seen checkpoints: {0}")]
    Read(String),
    #[error("Failed to parse last-seen checkpoints: {0}")]
    Parse(String),
    #[error("Failed to save last-seen checkpoints: {0}")]
    Write(String),
}

/// Persisted `(conversation, user) -> last seen` checkpoints.
///
/// Only used to recompute unread counts after a reload; the live counters
/// belong to the conversation index.
pub struct LastSeenStore {
    path: Option<PathBuf>,
    entries: HashMap<String, DateTime<Utc>>,
    /// Last error that occurred (for surfacing to UI)
    last_error: Option<LastSeenError>,
}

fn entry_key(conversation: &ConversationKey, user_id: &str) -> String {
    format!("{}|{}", conversation, user_id)
}

impl LastSeenStore {
    /// Open the checkpoint file in `data_dir`. A missing or unreadable file
    /// starts empty; check `last_error()` for what went wrong.
    pub fn new(data_dir: &Path) -> Self {
        let path = data_dir.join(LAST_SEEN_FILE);
        let (entries, last_error) = Self::load_from_file(&path);
        if let Some(e) = &last_error {
            warn!("{}", e);
        }
        Self {
            path: Some(path),
            entries,
            last_error,
        }
    }

    /// Store that never touches the filesystem
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: HashMap::new(),
            last_error: None,
        }
    }

    fn load_from_file(
        path: &Path,
    ) -> (HashMap<String, DateTime<Utc>>, Option<LastSeenError>) {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(entries) => (entries, None),
                Err(e) => (HashMap::new(), Some(LastSeenError::Parse(e.to_string()))),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (HashMap::new(), None),
            Err(e) => (HashMap::new(), Some(LastSeenError::Read(e.to_string()))),
        }
    }

    fn save_to_file(&mut self) -> Result<(), LastSeenError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| LastSeenError::Write(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| LastSeenError::Write(e.to_string()))?;
        }
        fs::write(path, json).map_err(|e| LastSeenError::Write(e.to_string()))?;
        self.last_error = None;
        Ok(())
    }

    pub fn last_error(&self) -> Option<&LastSeenError> {
        self.last_error.as_ref()
    }

    pub fn get(&self, conversation: &ConversationKey, user_id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(&entry_key(conversation, user_id)).copied()
    }

    /// Record a checkpoint and write it through.
    /// On write failure the previous in-memory value is restored.
    pub fn mark_seen(
        &mut self,
        conversation: &ConversationKey,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), LastSeenError> {
        let key = entry_key(conversation, user_id);
        let previous = self.entries.insert(key.clone(), at);

        if let Err(e) = self.save_to_file() {
            match previous {
                Some(previous) => self.entries.insert(key, previous),
                None => self.entries.remove(&key),
            };
            self.last_error = Some(LastSeenError::Write(e.to_string()));
            return Err(e);
        }
        debug!("Checkpoint {} at {}", conversation, at);
        Ok(())
    }
}

/// Messages in `messages` that count as unread for `local_user` given the
/// checkpoint `last_seen` (no checkpoint means everything from others is unread).
pub fn unread_since(
    messages: &[Message],
    last_seen: Option<DateTime<Utc>>,
    local_user: &str,
) -> u32 {
    let count = messages
        .iter()
        .filter(|m| !m.is_from(local_user))
        .filter(|m| last_seen.map_or(true, |seen| m.sent_at > seen))
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}
