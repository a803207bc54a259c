//! External player-lookup service boundary.
//!
//! Last-resort resolution source: a hosted index searched by raw display
//! name. Only the seam lives here; whether anything is wired behind it is a
//! deployment decision, and the resolver treats an absent or failing service
//! as "no result".

use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    /// Platform account id (17-digit numeric).
    Platform,
    /// Console identifier (derived 32-char).
    Console,
    Other,
}

#[derive(Debug, Clone)]
pub struct FoundIdentifier {
    pub kind: IdentifierKind,
    pub value: String,
}

#[async_trait]
pub trait PlayerLookup: Send + Sync {
    async fn search(&self, name: &str) -> Result<Vec<FoundIdentifier>>;
}
