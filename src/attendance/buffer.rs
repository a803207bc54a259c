//! Durable session buffer: accumulated online minutes per identifier.
//!
//! The on-disk form is a flat JSON array of `[identifier, minutes]` pairs so
//! an operator can inspect or hand-edit it. The file is rewritten wholesale
//! after mutating polls (last-write-wins) and deleted on commit/discard. The
//! in-memory map stays authoritative across write faults: a transient disk
//! error only defers durability, it never loses minutes.

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use log::{error, info};

pub struct SessionBuffer {
    path: PathBuf,
    /// Insertion-ordered; serialized verbatim.
    entries: Vec<(String, u64)>,
}

impl SessionBuffer {
    /// Restores the buffer from disk, or starts empty. A missing file is the
    /// normal first-run case; an unreadable or malformed file is logged and
    /// treated as empty rather than blocking startup.
    pub fn load(path: PathBuf) -> Self {
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<(String, u64)>>(&raw) {
                Ok(entries) => {
                    info!(
                        "restored {} attendance entries from {}",
                        entries.len(),
                        path.display()
                    );
                    entries
                }
                Err(err) => {
                    error!("attendance buffer {} is malformed: {err}", path.display());
                    Vec::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                error!("failed reading attendance buffer {}: {err}", path.display());
                Vec::new()
            }
        };
        Self { path, entries }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn credit(&mut self, identifier: &str, minutes: u64) {
        match self
            .entries
            .iter_mut()
            .find(|(id, _)| id == identifier)
        {
            Some((_, total)) => *total += minutes,
            None => self.entries.push((identifier.to_string(), minutes)),
        }
    }

    pub fn minutes(&self, identifier: &str) -> u64 {
        self.entries
            .iter()
            .find(|(id, _)| id == identifier)
            .map(|(_, minutes)| *minutes)
            .unwrap_or(0)
    }

    pub fn entries(&self) -> &[(String, u64)] {
        &self.entries
    }

    pub fn remove(&mut self, identifier: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(id, _)| id != identifier);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Rewrites the snapshot wholesale, replacing the prior file.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create buffer directory {}", parent.display())
                })?;
            }
        }
        let serialized = serde_json::to_string(&self.entries)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("failed to write attendance buffer {}", self.path.display()))
    }

    /// Removes the on-disk snapshot; already-absent is fine.
    pub fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| {
                format!("failed to delete attendance buffer {}", self.path.display())
            }),
        }
    }
}
