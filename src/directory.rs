//! Personnel-directory boundary: identifier links and attendance submission.
//!
//! The directory itself is an external system with its own data model; this
//! module only defines what the tracker needs from it.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use log::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub id: String,
    pub alias: String,
    pub active: bool,
}

#[async_trait]
pub trait PersonnelDirectory: Send + Sync {
    /// Identifier → profile-id link table.
    async fn identity_links(&self) -> Result<HashMap<String, String>>;

    async fn profile(&self, profile_id: &str) -> Result<Option<Profile>>;

    /// Records one attendance entry. `Ok(false)` means the directory refused
    /// the record; `Err` means the call itself failed.
    async fn submit_attendance(
        &self,
        event_id: &str,
        profile_id: &str,
        status_id: &str,
    ) -> Result<bool>;
}

/// Stand-in used when no directory is configured: nothing links, nothing
/// submits, and commits report every entry as unlinked.
pub struct NullDirectory;

#[async_trait]
impl PersonnelDirectory for NullDirectory {
    async fn identity_links(&self) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }

    async fn profile(&self, _profile_id: &str) -> Result<Option<Profile>> {
        Ok(None)
    }

    async fn submit_attendance(
        &self,
        event_id: &str,
        profile_id: &str,
        _status_id: &str,
    ) -> Result<bool> {
        warn!("no personnel directory configured; dropping attendance for profile {profile_id} (event {event_id})");
        Ok(false)
    }
}
