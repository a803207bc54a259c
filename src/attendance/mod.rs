//! Attendance session tracking: presence polling, durable accumulation, and
//! the review/commit/discard workflow that turns buffered minutes into
//! directory records.

mod buffer;

pub use buffer::SessionBuffer;

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::Mutex;

use crate::{
    config::{OperationalWindow, POLL_INTERVAL_MINUTES},
    directory::{PersonnelDirectory, Profile},
    identity::IdentityResolver,
    query::ServerQuery,
};

/// Directory status submitted for qualifying attendance ("present").
const PRESENT_STATUS_ID: &str = "1";

/// Why a buffered identifier could not be turned into a directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NoLink,
    NoProfile,
    InactiveProfile,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::NoLink => write!(f, "no profile link"),
            RejectReason::NoProfile => write!(f, "linked profile missing"),
            RejectReason::InactiveProfile => write!(f, "linked profile inactive"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum LinkResolution {
    Linked(Profile),
    Rejected(RejectReason),
}

#[derive(Debug, Clone)]
pub struct ReviewEntry {
    pub identifier: String,
    pub minutes: u64,
    pub resolution: LinkResolution,
}

#[derive(Debug, Clone)]
pub struct ReviewReport {
    pub threshold: u64,
    /// Entries at or above the threshold, linked or not.
    pub qualified: Vec<ReviewEntry>,
    /// Highest accumulated minutes in the whole buffer, qualifying or not.
    pub max_minutes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitStatus {
    Submitted,
    SubmissionFailed,
    Rejected(RejectReason),
}

#[derive(Debug, Clone)]
pub struct CommitEntry {
    pub identifier: String,
    pub minutes: u64,
    pub alias: Option<String>,
    pub status: CommitStatus,
}

#[derive(Debug, Clone)]
pub struct CommitReport {
    pub event_id: String,
    pub submitted: usize,
    pub entries: Vec<CommitEntry>,
}

/// Owns the session buffer and the poll/finalize workflow. All state sits
/// behind one async mutex: polls, reviews and commits may interleave freely
/// on the runtime but never see the buffer mid-mutation.
pub struct AttendanceTracker {
    window: OperationalWindow,
    query: Arc<dyn ServerQuery>,
    resolver: IdentityResolver,
    directory: Arc<dyn PersonnelDirectory>,
    buffer: Mutex<SessionBuffer>,
}

impl AttendanceTracker {
    pub fn new(
        window: OperationalWindow,
        query: Arc<dyn ServerQuery>,
        resolver: IdentityResolver,
        directory: Arc<dyn PersonnelDirectory>,
        buffer_path: PathBuf,
    ) -> Self {
        Self {
            window,
            query,
            resolver,
            directory,
            buffer: Mutex::new(SessionBuffer::load(buffer_path)),
        }
    }

    pub fn window(&self) -> OperationalWindow {
        self.window
    }

    /// One presence poll. Outside the operational window this is a no-op
    /// unless forced, and even a forced poll only logs presence: minutes are
    /// credited strictly inside the window. A poll that arrives while the
    /// previous one is still running is skipped outright.
    pub async fn poll(&self, force: bool) {
        let now = Utc::now();
        let in_window = self.window.contains(now);
        if !force && !in_window {
            return;
        }

        let Ok(mut buffer) = self.buffer.try_lock() else {
            info!("previous poll still in flight, skipping this tick");
            return;
        };

        let state = match self.query.query_state().await {
            Ok(state) => state,
            Err(err) => {
                warn!("presence poll skipped, state query failed: {err:#}");
                return;
            }
        };

        let mut updated = false;
        for player in &state.players {
            let identity = self.resolver.resolve(&player.name).await;
            let Some(primary_id) = identity.primary_id else {
                debug!("cannot attribute presence for {:?}", player.name);
                continue;
            };
            if in_window {
                buffer.credit(&primary_id, POLL_INTERVAL_MINUTES);
                updated = true;
            } else {
                debug!("{primary_id} online outside the operational window, not credited");
            }
        }

        if updated {
            // Memory stays authoritative on a write fault; the next mutating
            // poll retries the full snapshot.
            if let Err(err) = buffer.save() {
                error!("attendance buffer write failed, keeping in-memory state: {err:#}");
            }
        }
    }

    /// Read-only preview of what a commit at `threshold` would process.
    pub async fn review(&self, threshold: u64) -> ReviewReport {
        let buffer = self.buffer.lock().await;
        let qualified = self.qualify(&buffer, threshold).await;
        let max_minutes = buffer
            .entries()
            .iter()
            .map(|(_, minutes)| *minutes)
            .max()
            .unwrap_or(0);
        ReviewReport {
            threshold,
            qualified,
            max_minutes,
        }
    }

    /// Submits one record per linked qualifying entry, then removes exactly
    /// the entries this call processed. Sub-threshold leftovers survive for a
    /// later commit; submission failures are reported per entry but are not
    /// rolled back.
    pub async fn commit(&self, event_id: &str, threshold: u64) -> CommitReport {
        let mut buffer = self.buffer.lock().await;
        let qualified = self.qualify(&buffer, threshold).await;

        let mut entries = Vec::with_capacity(qualified.len());
        let mut submitted = 0;
        for entry in &qualified {
            let (alias, status) = match &entry.resolution {
                LinkResolution::Linked(profile) => {
                    let status = match self
                        .directory
                        .submit_attendance(event_id, &profile.id, PRESENT_STATUS_ID)
                        .await
                    {
                        Ok(true) => {
                            submitted += 1;
                            CommitStatus::Submitted
                        }
                        Ok(false) => CommitStatus::SubmissionFailed,
                        Err(err) => {
                            warn!("attendance submission failed for {}: {err:#}", profile.alias);
                            CommitStatus::SubmissionFailed
                        }
                    };
                    (Some(profile.alias.clone()), status)
                }
                LinkResolution::Rejected(reason) => (None, CommitStatus::Rejected(*reason)),
            };
            entries.push(CommitEntry {
                identifier: entry.identifier.clone(),
                minutes: entry.minutes,
                alias,
                status,
            });
        }

        for entry in &qualified {
            buffer.remove(&entry.identifier);
        }
        let persisted = if buffer.is_empty() {
            buffer.delete()
        } else {
            buffer.save()
        };
        if let Err(err) = persisted {
            error!("failed persisting buffer after commit: {err:#}");
        }

        info!(
            "committed attendance for event {event_id}: {submitted} submitted, {} processed",
            entries.len()
        );
        CommitReport {
            event_id: event_id.to_string(),
            submitted,
            entries,
        }
    }

    /// Drops everything, buffered and on disk, without submitting.
    pub async fn discard(&self) {
        let mut buffer = self.buffer.lock().await;
        buffer.clear();
        if let Err(err) = buffer.delete() {
            error!("failed deleting attendance buffer: {err:#}");
        }
        info!("attendance buffer discarded");
    }

    /// Snapshot of the buffered ledger, for operator display.
    pub async fn buffered_entries(&self) -> Vec<(String, u64)> {
        self.buffer.lock().await.entries().to_vec()
    }

    async fn qualify(&self, buffer: &SessionBuffer, threshold: u64) -> Vec<ReviewEntry> {
        let links = match self.directory.identity_links().await {
            Ok(links) => links,
            Err(err) => {
                warn!("identity link lookup failed, treating all entries as unlinked: {err:#}");
                HashMap::new()
            }
        };

        let mut qualified = Vec::new();
        for (identifier, minutes) in buffer.entries() {
            if *minutes < threshold {
                continue;
            }
            let resolution = match links.get(identifier) {
                None => LinkResolution::Rejected(RejectReason::NoLink),
                Some(profile_id) => match self.directory.profile(profile_id).await {
                    Ok(Some(profile)) if profile.active => LinkResolution::Linked(profile),
                    Ok(Some(_)) => LinkResolution::Rejected(RejectReason::InactiveProfile),
                    Ok(None) => LinkResolution::Rejected(RejectReason::NoProfile),
                    Err(err) => {
                        warn!("profile fetch failed for {profile_id}: {err:#}");
                        LinkResolution::Rejected(RejectReason::NoProfile)
                    }
                },
            };
            qualified.push(ReviewEntry {
                identifier: identifier.clone(),
                minutes: *minutes,
                resolution,
            });
        }
        qualified
    }
}
