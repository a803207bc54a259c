//! Display-name normalization and multi-source identity resolution.
//!
//! A player's in-game name carries unit decoration (callsign tags, rank
//! abbreviations, qualification brackets) that none of the identifier stores
//! know about. Resolution strips the decoration, then walks the sources in
//! order of reliability: live state query, console player list, optional
//! external lookup, and finally the deterministic secondary-id derivation.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use log::{debug, warn};
use md5::{Digest, Md5};
use regex::Regex;

use crate::{
    lookup::{IdentifierKind, PlayerLookup},
    query::ServerQuery,
    rcon::PlayerRecord,
};

/// Length of the derived console identifier (hex MD5).
pub const SECONDARY_ID_LEN: usize = 32;

static PRIMARY_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{17}$").unwrap());

static LEADING_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\[.*?\]\s+").unwrap());

static TRAILING_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+\[.*?\]$").unwrap());

// Order matters: compound ranks before their prefixes ("maj gen" before "maj").
static RANK_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(gen|maj gen|brig|col|lt col|maj|capt|lt|2lt|wo1|wo2|ssgt|csgt|sgt|cpl|lcpl|tpr|sig|rct|pte|am|as1|as2|po|cpo|cmdr|sqn ldr|flt lt|fg off|plt off|wg cdr)\.?\s+",
    )
    .unwrap()
});

/// Platform account ids are exactly 17 decimal digits; anything else is not
/// treated as one, no implicit conversions.
pub fn is_primary_id(value: &str) -> bool {
    PRIMARY_ID_RE.is_match(value)
}

pub fn is_secondary_id(value: &str) -> bool {
    value.len() == SECONDARY_ID_LEN
}

/// Lowercases and strips callsign tags, rank prefixes and trailing
/// qualification brackets. Runs to a fixed point so stacked decoration
/// ("[A1] Sgt Smith [CMT]") comes off completely and the result is idempotent.
pub fn normalize_name(name: &str) -> String {
    let mut current = name.to_lowercase();
    loop {
        let stripped = strip_decoration(&current);
        if stripped == current {
            return current;
        }
        current = stripped;
    }
}

fn strip_decoration(name: &str) -> String {
    let name = LEADING_TAG_RE.replace(name, "");
    let name = RANK_PREFIX_RE.replace(&name, "");
    let name = TRAILING_TAG_RE.replace(&name, "");
    name.trim().to_string()
}

/// Derives the console identifier bound to a platform account id. This is the
/// protocol's account-binding scheme, so it must be reproducible bit-for-bit:
/// lowercase hex MD5 of `"BE"` + the account id.
pub fn derive_secondary_id(primary_id: &str) -> String {
    let digest = Md5::digest(format!("BE{primary_id}").as_bytes());
    format!("{digest:x}")
}

/// Best-effort identity for a display name. Both halves nullable; the all-none
/// value is the normal "cannot attribute" result, not a fault.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityMatch {
    pub primary_id: Option<String>,
    pub secondary_id: Option<String>,
}

impl IdentityMatch {
    pub fn is_unresolved(&self) -> bool {
        self.primary_id.is_none() && self.secondary_id.is_none()
    }
}

/// The console client's live player list, behind a seam so resolution can be
/// exercised without a socket.
#[async_trait]
pub trait PlayerSource: Send + Sync {
    async fn players(&self) -> Vec<PlayerRecord>;
}

pub struct IdentityResolver {
    query: Arc<dyn ServerQuery>,
    console: Arc<dyn PlayerSource>,
    lookup: Option<Arc<dyn PlayerLookup>>,
}

impl IdentityResolver {
    pub fn new(
        query: Arc<dyn ServerQuery>,
        console: Arc<dyn PlayerSource>,
        lookup: Option<Arc<dyn PlayerLookup>>,
    ) -> Self {
        Self {
            query,
            console,
            lookup,
        }
    }

    pub async fn resolve(&self, display_name: &str) -> IdentityMatch {
        let target = normalize_name(display_name);
        let mut primary = None;
        let mut secondary = None;

        match self.query.query_state().await {
            Ok(state) => {
                let names: Vec<String> =
                    state.players.iter().map(|p| p.name.clone()).collect();
                if let Some(index) = match_index(&names, &target) {
                    let candidates = &state.players[index].candidates;
                    primary = candidates.iter().find(|c| is_primary_id(c)).cloned();
                    secondary = candidates.iter().find(|c| is_secondary_id(c)).cloned();
                }
            }
            Err(err) => debug!("state query unavailable during resolve: {err:#}"),
        }

        if primary.is_none() || secondary.is_none() {
            let players = self.console.players().await;
            let names: Vec<String> = players.iter().map(|p| p.name.clone()).collect();
            if let Some(index) = match_index(&names, &target) {
                let record = &players[index];
                if primary.is_none() {
                    primary = record.primary_id.clone();
                }
                if secondary.is_none() {
                    secondary = record.secondary_id.clone();
                }
            }
        }

        if primary.is_none() {
            if let Some(lookup) = &self.lookup {
                match lookup.search(display_name).await {
                    Ok(found) => {
                        primary = found
                            .into_iter()
                            .find(|f| f.kind == IdentifierKind::Platform)
                            .map(|f| f.value);
                    }
                    Err(err) => warn!("lookup service failed for {display_name:?}: {err:#}"),
                }
            }
        }

        if secondary.is_none() {
            if let Some(id) = &primary {
                secondary = Some(derive_secondary_id(id));
            }
        }

        IdentityMatch {
            primary_id: primary,
            secondary_id: secondary,
        }
    }
}

/// Exact normalized equality always wins; substring containment (either
/// direction) is only a fallback when nothing matches exactly, to soft-match
/// typos without stealing from players whose normalized names overlap.
fn match_index(names: &[String], target: &str) -> Option<usize> {
    let normalized: Vec<String> = names.iter().map(|name| normalize_name(name)).collect();
    if let Some(index) = normalized.iter().position(|name| name == target) {
        return Some(index);
    }
    if target.is_empty() {
        return None;
    }
    normalized
        .iter()
        .position(|name| !name.is_empty() && (name.contains(target) || target.contains(name)))
}
