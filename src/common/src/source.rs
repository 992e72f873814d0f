//! Price source identity.
//!
//! Every marketplace or data provider the pipeline talks to is one variant of
//! [`Source`]. The set is closed: adding a provider means adding a variant and
//! an adapter for it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported price sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Card catalog. Carries reference prices but is not a marketplace.
    Scryfall,
    TcgPlayer,
    Cardmarket,
}

impl Source {
    /// All sources in a stable order.
    pub const ALL: [Source; 3] = [Source::Scryfall, Source::TcgPlayer, Source::Cardmarket];

    /// Get the source name as a string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Scryfall => "scryfall",
            Source::TcgPlayer => "tcgplayer",
            Source::Cardmarket => "cardmarket",
        }
    }

    /// Parse source from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "scryfall" => Some(Source::Scryfall),
            "tcgplayer" => Some(Source::TcgPlayer),
            "cardmarket" | "mkm" => Some(Source::Cardmarket),
            _ => None,
        }
    }

    /// Prefix used for this source's environment variables.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Source::Scryfall => "SCRYFALL",
            Source::TcgPlayer => "TCGPLAYER",
            Source::Cardmarket => "CARDMARKET",
        }
    }

    /// Reference sources are used for card metadata and never listed as
    /// marketplaces.
    pub fn is_reference(&self) -> bool {
        matches!(self, Source::Scryfall)
    }

    /// Currency the source quotes in.
    pub fn currency(&self) -> &'static str {
        match self {
            Source::Scryfall => "USD",
            Source::TcgPlayer => "USD",
            Source::Cardmarket => "EUR",
        }
    }

    /// Default public API base URL.
    pub fn default_api_url(&self) -> &'static str {
        match self {
            Source::Scryfall => "https://api.scryfall.com",
            Source::TcgPlayer => "https://api.tcgplayer.com",
            Source::Cardmarket => "https://api.cardmarket.com/ws/v2.0/output.json",
        }
    }

    /// Default minimum gap between two requests, in milliseconds.
    /// Scryfall asks for 50-100ms, Cardmarket allows roughly 1 req/s on the
    /// basic tier.
    pub fn default_min_interval_ms(&self) -> u64 {
        match self {
            Source::Scryfall => 100,
            Source::TcgPlayer => 250,
            Source::Cardmarket => 1000,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
