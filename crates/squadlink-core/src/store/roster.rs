use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::StoreError;
use crate::models::{ConversationKey, MemberRole, RosterEntry};

/// Friend/team roster: identity overlay for the conversation list, and team
/// roles for the unpin permission check.
#[async_trait]
pub trait RosterProvider: Send + Sync {
    async fn entries(&self) -> Result<Vec<RosterEntry>, StoreError>;

    async fn lookup(&self, key: &ConversationKey) -> Result<Option<RosterEntry>, StoreError>;

    async fn role_in(&self, team_id: &str, user_id: &str) -> Result<MemberRole, StoreError>;
}

/// Roster held in memory. Used where no roster service is available
/// (the CLI) and as the test double.
#[derive(Default)]
pub struct StaticRoster {
    entries: RwLock<Vec<RosterEntry>>,
    roles: RwLock<HashMap<(String, String), MemberRole>>,
}

impl StaticRoster {
    pub fn new(entries: Vec<RosterEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
            roles: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_role(&self, team_id: &str, user_id: &str, role: MemberRole) {
        self.roles
            .write()
            .insert((team_id.to_string(), user_id.to_string()), role);
    }

    pub fn upsert(&self, entry: RosterEntry) {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|e| e.key == entry.key) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }
}

#[async_trait]
impl RosterProvider for StaticRoster {
    async fn entries(&self) -> Result<Vec<RosterEntry>, StoreError> {
        Ok(self.entries.read().clone())
    }

    async fn lookup(&self, key: &ConversationKey) -> Result<Option<RosterEntry>, StoreError> {
        Ok(self.entries.read().iter().find(|e| &e.key == key).cloned())
    }

    async fn role_in(&self, team_id: &str, user_id: &str) -> Result<MemberRole, StoreError> {
        Ok(self
            .roles
            .read()
            .get(&(team_id.to_string(), user_id.to_string()))
            .copied()
            .unwrap_or_default())
    }
}
