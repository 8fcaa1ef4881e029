//! Giveaway feed + catalog adapters: feed fetching, listing normalization and IGDB enrichment lookups.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use gdeals_core::{CatalogGame, Deal, DealImage, Platform, RawListing, Tag, TagKind};
use gdeals_storage::{FetchError, FetchRequest, HttpFetcher};
use regex::RegexBuilder;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const GAMERPOWER_DEFAULT_URL: &str =
    "https://www.gamerpower.com/api/giveaways?type=game&platform=pc&status=active";

const GAMERPOWER_SOURCE_ID: &str = "gamerpower";
/// `status` of the object GamerPower returns instead of an array when nothing is live.
const GAMERPOWER_NO_GIVEAWAYS_STATUS: i64 = 0;
const REDIRECT_SOURCE_ID: &str = "redirect";
const IGDB_SOURCE_ID: &str = "igdb";
const IGDB_IMAGES_SOURCE_ID: &str = "igdb-images";

pub const TWITCH_TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
pub const IGDB_API_BASE: &str = "https://api.igdb.com/v4";
pub const IGDB_IMAGE_BASE: &str = "https://images.igdb.com/igdb/image/upload";

/// Page cap of the IGDB taxonomy endpoints. Anything past the first page is not fetched.
pub const IGDB_TAG_PAGE_LIMIT: usize = 100;

/// IGDB `category` value for a main game (excludes DLC, bundles, mods).
const IGDB_BASE_GAME_CATEGORY: i64 = 0;

/// Feed label renamed to its short storefront name.
const EPIC_STORE_LABEL: &str = "Epic Games Store";
const EPIC_SHORT_LABEL: &str = "Epic Games";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("feed payload could not be decoded: {0}")]
    Decode(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait GiveawayFeed: Send + Sync {
    fn feed_id(&self) -> &'static str;

    async fn list_active_giveaways(&self) -> Result<Vec<RawListing>, FeedError>;
}

/// Decodes a feed body. An object with `status: 0` is the feed's "nothing active" answer;
/// any other object (rate limits, server errors) is rejected so callers never read it as empty.
pub fn decode_feed_body(body: &[u8]) -> Result<Vec<RawListing>, FeedError> {
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|e| FeedError::Decode(e.to_string()))?;
    match value {
        JsonValue::Array(items) => {
            let mut listings = Vec::with_capacity(items.len());
            for item in items {
                match serde_json::from_value::<RawListing>(item) {
                    Ok(listing) => listings.push(listing),
                    Err(err) => warn!(error = %err, "skipping malformed feed record"),
                }
            }
            Ok(listings)
        }
        JsonValue::Object(obj) => {
            let status_message = obj.get("status_message").and_then(|v| v.as_str()).unwrap_or("");
            if obj.get("status").and_then(JsonValue::as_i64) == Some(GAMERPOWER_NO_GIVEAWAYS_STATUS) {
                debug!(status_message, "feed reported no active giveaways");
                return Ok(Vec::new());
            }
            Err(FeedError::Decode(format!(
                "feed answered with a status object: {}",
                JsonValue::Object(obj.clone())
            )))
        }
        other => Err(FeedError::Decode(format!("unexpected feed payload: {other}"))),
    }
}

pub struct GamerPowerFeed {
    http: Arc<HttpFetcher>,
    endpoint: String,
}

impl GamerPowerFeed {
    pub fn new(http: Arc<HttpFetcher>, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl GiveawayFeed for GamerPowerFeed {
    fn feed_id(&self) -> &'static str {
        GAMERPOWER_SOURCE_ID
    }

    async fn list_active_giveaways(&self) -> Result<Vec<RawListing>, FeedError> {
        let resp = self.http.fetch_bytes(GAMERPOWER_SOURCE_ID, &self.endpoint).await?;
        let listings = decode_feed_body(&resp.body)?;
        info!(count = listings.len(), "fetched giveaway feed");
        Ok(listings)
    }
}

/// Feed served from a captured JSON response on disk.
#[derive(Debug, Clone)]
pub struct FixtureFeed {
    path: PathBuf,
}

impl FixtureFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl GiveawayFeed for FixtureFeed {
    fn feed_id(&self) -> &'static str {
        "fixture"
    }

    async fn list_active_giveaways(&self) -> Result<Vec<RawListing>, FeedError> {
        let bytes = read_fixture_bytes(&self.path)?;
        decode_feed_body(&bytes)
    }
}

fn read_fixture_bytes(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Resolves an outbound link to its final destination.
#[async_trait]
pub trait LinkResolver: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<String, FetchError>;
}

#[async_trait]
impl LinkResolver for HttpFetcher {
    async fn resolve(&self, url: &str) -> Result<String, FetchError> {
        self.resolve_redirect(REDIRECT_SOURCE_ID, url).await
    }
}

/// Splits the feed's platform string and shortens the Epic storefront label.
pub fn split_platforms(platforms: &str) -> Vec<String> {
    platforms
        .split(", ")
        .map(|p| {
            if p == EPIC_STORE_LABEL {
                EPIC_SHORT_LABEL.to_string()
            } else {
                p.to_string()
            }
        })
        .collect()
}

/// Picks the supported storefront for a listing. Every entry is inspected and
/// the last supported one wins; only the first space is removed before matching.
pub fn main_platform(platforms: &[String]) -> Option<Platform> {
    let mut selected = None;
    for platform in platforms {
        let key = platform.to_lowercase().replacen(' ', "", 1);
        if let Some(found) = Platform::from_key(&key) {
            selected = Some(found);
        }
    }
    selected
}

/// Cuts the title at the first `(<platform>)` or bare `<platform>`, case-insensitively.
pub fn cleanup_title(title: &str, platform_name: &str) -> String {
    let escaped = regex::escape(platform_name);
    let pattern = format!(r"(?:\({escaped}\)|{escaped})");
    let Ok(re) = RegexBuilder::new(&pattern).case_insensitive(true).build() else {
        return title.to_string();
    };
    match re.find(title) {
        Some(m) => {
            let cleaned = title[..m.start()].trim();
            if cleaned.is_empty() {
                title.to_string()
            } else {
                cleaned.to_string()
            }
        }
        None => title.to_string(),
    }
}

fn is_usable_url(candidate: &str) -> bool {
    url::Url::parse(candidate)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}

/// Follows the affiliate link; any failure or unusable answer keeps the original link.
pub async fn resolve_outbound_url(resolver: &dyn LinkResolver, url: &str) -> String {
    match resolver.resolve(url).await {
        Ok(resolved) if !resolved.is_empty() && is_usable_url(&resolved) => resolved,
        Ok(resolved) => {
            debug!(url, resolved, "redirect target unusable, keeping original link");
            url.to_string()
        }
        Err(err) => {
            debug!(url, error = %err, "redirect resolution failed, keeping original link");
            url.to_string()
        }
    }
}

/// Converts a raw feed record into a [`Deal`]. Listings without a supported platform yield `None`.
pub async fn normalize_listing(resolver: &dyn LinkResolver, raw: &RawListing) -> Option<Deal> {
    let platforms = split_platforms(&raw.platforms);
    let platform = main_platform(&platforms)?;

    let url = resolve_outbound_url(resolver, &raw.open_giveaway_url).await;
    let name = cleanup_title(&raw.title, platform.display_name());

    Some(Deal {
        id: raw.id,
        name,
        description: raw.description.clone(),
        images: vec![DealImage::Url(raw.image.clone())],
        url,
        end_date: raw.end_date.clone(),
        main_platform: platform,
        platforms,
        tags: Vec::new(),
        active: true,
        catalog_id: None,
    })
}

pub async fn normalize_listings(resolver: &dyn LinkResolver, raws: &[RawListing]) -> Vec<Deal> {
    let mut deals = Vec::with_capacity(raws.len());
    for raw in raws {
        match normalize_listing(resolver, raw).await {
            Some(deal) => deals.push(deal),
            None => debug!(id = raw.id, platforms = %raw.platforms, "dropping listing without supported platform"),
        }
    }
    deals
}

/// Ids of feed records that map to a supported platform. No network calls.
pub fn supported_listing_ids(raws: &[RawListing]) -> Vec<i64> {
    raws.iter()
        .filter(|raw| main_platform(&split_platforms(&raw.platforms)).is_some())
        .map(|raw| raw.id)
        .collect()
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog credential renewal failed: {0}")]
    Auth(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("catalog payload could not be decoded: {0}")]
    Decode(String),
    #[error("catalog record is missing {0}")]
    MissingField(String),
}

/// Process-wide catalog bearer token with its expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerCredential {
    pub token: String,
    pub expire_date: DateTime<Utc>,
}

impl BearerCredential {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expire_date
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverSize {
    /// Small slot of a deal's image pair.
    CoverBig,
    /// Large slot of a deal's image pair.
    Hd720,
}

impl CoverSize {
    pub fn as_igdb(self) -> &'static str {
        match self {
            CoverSize::CoverBig => "cover_big",
            CoverSize::Hd720 => "720p",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoverMode {
    /// Download both sizes and keep the bytes.
    #[default]
    Inline,
    /// Keep the image URLs only.
    Url,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverImages {
    pub small: DealImage,
    pub large: DealImage,
}

impl CoverImages {
    pub fn into_vec(self) -> Vec<DealImage> {
        vec![self.small, self.large]
    }
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Best base-game match for `title`, if any.
    async fn search_game(&self, title: &str) -> Result<Option<CatalogGame>, CatalogError>;

    /// Cover art for a catalog cover id, as `[small, large]`.
    async fn cover_images(&self, cover_id: i64) -> Result<CoverImages, CatalogError>;

    /// First page of one taxonomy.
    async fn list_tags(&self, kind: TagKind) -> Result<Vec<Tag>, CatalogError>;
}

#[derive(Debug, Deserialize)]
struct TwitchTokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct IgdbCover {
    #[serde(default)]
    image_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IgdbNamedRow {
    id: i64,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IgdbConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    pub api_base: String,
    pub image_base: String,
    pub cover_mode: CoverMode,
}

impl IgdbConfig {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_url: TWITCH_TOKEN_URL.to_string(),
            api_base: IGDB_API_BASE.to_string(),
            image_base: IGDB_IMAGE_BASE.to_string(),
            cover_mode: CoverMode::default(),
        }
    }
}

pub struct IgdbClient {
    http: Arc<HttpFetcher>,
    config: IgdbConfig,
    credential: Mutex<Option<BearerCredential>>,
}

impl IgdbClient {
    pub fn new(http: Arc<HttpFetcher>, config: IgdbConfig) -> Self {
        Self {
            http,
            config,
            credential: Mutex::new(None),
        }
    }

    /// Current token, renewing first when absent or expired. Concurrent callers
    /// may both renew; the later write wins and both tokens are valid.
    async fn bearer(&self) -> Result<String, CatalogError> {
        {
            let guard = self.credential.lock().await;
            if let Some(credential) = guard.as_ref() {
                if credential.is_valid_at(Utc::now()) {
                    return Ok(credential.token.clone());
                }
            }
        }
        let credential = self.renew_credential().await?;
        let token = credential.token.clone();
        *self.credential.lock().await = Some(credential);
        Ok(token)
    }

    async fn invalidate_credential(&self) {
        *self.credential.lock().await = None;
    }

    async fn renew_credential(&self) -> Result<BearerCredential, CatalogError> {
        let url = url::Url::parse_with_params(
            &self.config.token_url,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ],
        )
        .map_err(|e| CatalogError::Auth(format!("invalid token url: {e}")))?;

        let resp = self
            .http
            .execute(IGDB_SOURCE_ID, FetchRequest::post(url.as_str(), String::new()))
            .await
            .map_err(|e| CatalogError::Auth(e.to_string()))?;
        let token: TwitchTokenResponse = serde_json::from_slice(&resp.body)
            .map_err(|e| CatalogError::Auth(format!("invalid token response: {e}")))?;

        info!(expires_in = token.expires_in, "renewed catalog bearer credential");
        Ok(BearerCredential {
            token: token.access_token,
            expire_date: Utc::now() + ChronoDuration::seconds(token.expires_in),
        })
    }

    async fn post_query(&self, endpoint: &str, body: &str) -> Result<Vec<u8>, CatalogError> {
        let url = format!("{}/{}", self.config.api_base, endpoint);
        let mut renewed = false;
        loop {
            let token = self.bearer().await?;
            let request = FetchRequest::post(url.clone(), body.to_string())
                .header("Client-ID", self.config.client_id.clone())
                .header("Authorization", format!("Bearer {token}"))
                .header("Content-Type", "text/plain");
            match self.http.execute(IGDB_SOURCE_ID, request).await {
                Ok(resp) => return Ok(resp.body),
                Err(err) if err.status() == Some(401) && !renewed => {
                    warn!(endpoint, "catalog rejected bearer credential, renewing once");
                    self.invalidate_credential().await;
                    renewed = true;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn query<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &str,
    ) -> Result<Vec<T>, CatalogError> {
        let bytes = self.post_query(endpoint, body).await?;
        serde_json::from_slice(&bytes).map_err(|e| CatalogError::Decode(format!("{endpoint}: {e}")))
    }

    pub async fn cover_hash(&self, cover_id: i64) -> Result<String, CatalogError> {
        let body = format!("fields image_id; where id = {cover_id};");
        let covers: Vec<IgdbCover> = self.query("covers", &body).await?;
        covers
            .into_iter()
            .next()
            .and_then(|c| c.image_id)
            .ok_or_else(|| CatalogError::MissingField(format!("image_id for cover {cover_id}")))
    }

    pub async fn cover_image(&self, hash: &str, size: CoverSize) -> Result<DealImage, CatalogError> {
        let url = cover_image_url(&self.config.image_base, size, hash);
        match self.config.cover_mode {
            CoverMode::Url => Ok(DealImage::Url(url)),
            CoverMode::Inline => {
                let resp = self.http.fetch_bytes(IGDB_IMAGES_SOURCE_ID, &url).await?;
                Ok(DealImage::inline("image/jpeg", &resp.body))
            }
        }
    }
}

#[async_trait]
impl CatalogClient for IgdbClient {
    async fn search_game(&self, title: &str) -> Result<Option<CatalogGame>, CatalogError> {
        let games: Vec<CatalogGame> = self.query("games", &search_query(title)).await?;
        Ok(games.into_iter().next())
    }

    async fn cover_images(&self, cover_id: i64) -> Result<CoverImages, CatalogError> {
        let hash = self.cover_hash(cover_id).await?;
        let small = self.cover_image(&hash, CoverSize::CoverBig).await?;
        let large = self.cover_image(&hash, CoverSize::Hd720).await?;
        Ok(CoverImages { small, large })
    }

    async fn list_tags(&self, kind: TagKind) -> Result<Vec<Tag>, CatalogError> {
        let body = format!("fields name; limit {IGDB_TAG_PAGE_LIMIT};");
        let bytes = self.post_query(taxonomy_endpoint(kind), &body).await?;
        decode_tag_rows(kind, &bytes)
    }
}

/// Apicalypse body for a base-game title search.
pub fn search_query(title: &str) -> String {
    let escaped = title.replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        "fields name,summary,cover,category,themes,genres,game_modes; search \"{escaped}\"; where category = {IGDB_BASE_GAME_CATEGORY};"
    )
}

pub fn cover_image_url(image_base: &str, size: CoverSize, hash: &str) -> String {
    format!("{image_base}/t_{}/{hash}.jpg", size.as_igdb())
}

fn taxonomy_endpoint(kind: TagKind) -> &'static str {
    match kind {
        TagKind::Genre => "genres",
        TagKind::Theme => "themes",
        TagKind::GameMode => "game_modes",
    }
}

/// Rows without a name are skipped.
pub fn decode_tag_rows(kind: TagKind, body: &[u8]) -> Result<Vec<Tag>, CatalogError> {
    let rows: Vec<IgdbNamedRow> =
        serde_json::from_slice(body).map_err(|e| CatalogError::Decode(format!("{}: {e}", kind.as_str())))?;
    Ok(rows
        .into_iter()
        .filter_map(|row| match row.name {
            Some(name) if !name.is_empty() => Some(Tag {
                catalog_tag_id: row.id,
                name,
                kind,
            }),
            _ => None,
        })
        .collect())
}
