//! Core domain model for gdeals: deals, catalog tags and raw feed listings.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Storefronts a deal may be recorded under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "steam")]
    Steam,
    #[serde(rename = "epicgames")]
    EpicGames,
    #[serde(rename = "gog")]
    Gog,
}

impl Platform {
    pub const SUPPORTED: [Platform; 3] = [Platform::Steam, Platform::EpicGames, Platform::Gog];

    /// Lowercase, space-free key used for matching and persistence.
    pub fn key(self) -> &'static str {
        match self {
            Platform::Steam => "steam",
            Platform::EpicGames => "epicgames",
            Platform::Gog => "gog",
        }
    }

    /// Name as it appears in feed titles, e.g. "Escape Academy (Epic Games) Giveaway".
    pub fn display_name(self) -> &'static str {
        match self {
            Platform::Steam => "Steam",
            Platform::EpicGames => "Epic Games",
            Platform::Gog => "GOG",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::SUPPORTED.into_iter().find(|p| p.key() == key)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// One entry of a deal's image list. Convention is `[small, large]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DealImage {
    Url(String),
    Inline { content_type: String, data: String },
}

impl DealImage {
    pub fn inline(content_type: &str, bytes: &[u8]) -> Self {
        DealImage::Inline {
            content_type: content_type.to_string(),
            data: BASE64.encode(bytes),
        }
    }

    pub fn as_url(&self) -> Option<&str> {
        match self {
            DealImage::Url(url) => Some(url),
            DealImage::Inline { .. } => None,
        }
    }

    pub fn decode_inline(&self) -> Option<Vec<u8>> {
        match self {
            DealImage::Url(_) => None,
            DealImage::Inline { data, .. } => BASE64.decode(data).ok(),
        }
    }
}

/// Normalized, persisted giveaway record. `id` is the feed's identifier and the primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub images: Vec<DealImage>,
    pub url: String,
    pub end_date: String,
    pub main_platform: Platform,
    pub platforms: Vec<String>,
    pub tags: Vec<String>,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_id: Option<i64>,
}

impl Deal {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        parse_end_date(&self.end_date)
    }

    /// Unparsable end dates never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|end| end < now)
    }
}

/// Parses a feed end date. Returns `None` for placeholders such as `"N/A"`.
///
/// Accepted shapes: `2025-01-23 23:59:00` (UTC), RFC 3339, and a bare
/// `2025-01-23` which is taken as the last second of that day.
pub fn parse_end_date(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .map(|dt| dt.and_utc())
}

/// Giveaway record as delivered by the feed, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    pub open_giveaway_url: String,
    #[serde(default)]
    pub end_date: String,
    #[serde(default)]
    pub platforms: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub worth: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagKind {
    Genre,
    Theme,
    GameMode,
}

impl TagKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TagKind::Genre => "genre",
            TagKind::Theme => "theme",
            TagKind::GameMode => "game_mode",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "genre" => Some(TagKind::Genre),
            "theme" => Some(TagKind::Theme),
            "game_mode" => Some(TagKind::GameMode),
            _ => None,
        }
    }
}

/// Catalog taxonomy entry, unique on `(catalog_tag_id, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub catalog_tag_id: i64,
    pub name: String,
    pub kind: TagKind,
}

impl Tag {
    /// Placeholder carrying only the key, resolved later against the tag catalog.
    pub fn unresolved(catalog_tag_id: i64, kind: TagKind) -> Self {
        Self {
            catalog_tag_id,
            name: String::new(),
            kind,
        }
    }
}

/// Tag id lists as returned by a catalog record. Any subset may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogTagIds {
    #[serde(default)]
    pub genres: Option<Vec<i64>>,
    #[serde(default)]
    pub game_modes: Option<Vec<i64>>,
    #[serde(default)]
    pub themes: Option<Vec<i64>>,
}

impl CatalogTagIds {
    pub fn is_empty_shape(&self) -> bool {
        self.genres.is_none() && self.game_modes.is_none() && self.themes.is_none()
    }
}

/// Input accepted by tag resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagSource {
    Resolved(Vec<Tag>),
    Ids(CatalogTagIds),
}

/// Best-match game record from the catalog title search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogGame {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub cover: Option<i64>,
    #[serde(default)]
    pub category: Option<i64>,
    #[serde(default)]
    pub genres: Option<Vec<i64>>,
    #[serde(default)]
    pub game_modes: Option<Vec<i64>>,
    #[serde(default)]
    pub themes: Option<Vec<i64>>,
}

impl CatalogGame {
    pub fn tag_ids(&self) -> CatalogTagIds {
        CatalogTagIds {
            genres: self.genres.clone(),
            game_modes: self.game_modes.clone(),
            themes: self.themes.clone(),
        }
    }
}
