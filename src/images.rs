use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use crate::error::{GenError, Result};

pub const PLACEHOLDER_IMAGE_URL: &str = "https://via.placeholder.com/300x200.png?text=No+Image";

const SERVICE: &str = "wikimedia";
const FILE_NAMESPACE: &str = "6";
const RETRY_SUFFIX: &str = " photo";
const MAX_QUERY_WORDS: usize = 5;
const VALID_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".svg", ".webp"];

static NON_WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedImage {
    pub query: String,
    pub url: String,
}

impl ResolvedImage {
    pub fn is_placeholder(&self) -> bool {
        self.url == PLACEHOLDER_IMAGE_URL
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageInfo {
    pub mime: String,
    pub url: String,
}

impl ImageInfo {
    pub fn is_usable(&self) -> bool {
        let url = self.url.to_lowercase();
        self.mime.starts_with("image/") && VALID_EXTENSIONS.iter().any(|ext| url.ends_with(ext))
    }
}

/// Two-step media search: candidate titles first, then metadata per title.
pub trait ImageSearch: Send + Sync {
    fn search(&self, query: &str, limit: usize) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn image_info(&self, title: &str) -> impl Future<Output = Result<Option<ImageInfo>>> + Send;
}

/// Strips punctuation and keeps the first few words, falling back to
/// `fallback` when nothing is left.
pub fn normalize_query(raw: &str, fallback: &str) -> String {
    fn clean(text: &str) -> String {
        let stripped = NON_WORD_RE.replace_all(text, "");
        stripped
            .split_whitespace()
            .take(MAX_QUERY_WORDS)
            .collect::<Vec<_>>()
            .join(" ")
    }

    let query = clean(raw);
    if query.is_empty() {
        clean(fallback)
    } else {
        query
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    query: Option<SearchQuery>,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    search: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    title: String,
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    query: Option<InfoQuery>,
}

#[derive(Debug, Deserialize)]
struct InfoQuery {
    #[serde(default)]
    pages: HashMap<String, InfoPage>,
}

#[derive(Debug, Deserialize)]
struct InfoPage {
    #[serde(default)]
    imageinfo: Vec<RawImageInfo>,
}

#[derive(Debug, Deserialize)]
struct RawImageInfo {
    #[serde(default)]
    mime: String,
    #[serde(default)]
    url: String,
}

/// Wikimedia Commons `api.php` client.
pub struct WikimediaSearch {
    api_url: String,
    client: reqwest::Client,
}

impl WikimediaSearch {
    pub fn new(api_url: String, user_agent: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Could not build image search client: {}. Using defaults.", e);
                reqwest::Client::new()
            });

        WikimediaSearch { api_url, client }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, params: &[(&str, &str)]) -> Result<T> {
        let response = self
            .client
            .get(&self.api_url)
            .query(params)
            .send()
            .await
            .map_err(GenError::http(SERVICE))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GenError::Status {
                service: SERVICE,
                status,
                body,
            });
        }

        let body = response.text().await.map_err(GenError::http(SERVICE))?;
        serde_json::from_str(&body).map_err(|e| GenError::malformed(SERVICE, e))
    }
}

impl ImageSearch for WikimediaSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let limit = limit.to_string();
        let params = [
            ("action", "query"),
            ("format", "json"),
            ("list", "search"),
            ("srsearch", query),
            ("srnamespace", FILE_NAMESPACE),
            ("srlimit", limit.as_str()),
        ];

        let response: SearchResponse = self.get_json(&params).await?;
        Ok(response
            .query
            .map(|q| q.search.into_iter().map(|hit| hit.title).collect())
            .unwrap_or_default())
    }

    async fn image_info(&self, title: &str) -> Result<Option<ImageInfo>> {
        let params = [
            ("action", "query"),
            ("format", "json"),
            ("titles", title),
            ("prop", "imageinfo"),
            ("iiprop", "url|mime"),
            ("iiurlwidth", "800"),
            ("iiurlheight", "600"),
        ];

        let response: InfoResponse = self.get_json(&params).await?;
        let info = response
            .query
            .and_then(|q| q.pages.into_values().next())
            .and_then(|page| page.imageinfo.into_iter().next())
            .map(|raw| ImageInfo {
                mime: raw.mime,
                url: raw.url,
            });
        Ok(info)
    }
}

pub struct ImageResolver<S> {
    search: S,
    candidate_limit: usize,
}

impl<S: ImageSearch> ImageResolver<S> {
    pub fn new(search: S, candidate_limit: usize) -> Self {
        ImageResolver {
            search,
            candidate_limit,
        }
    }

    /// Returns a direct image URL for `query`, or [`PLACEHOLDER_IMAGE_URL`]
    /// once `max_attempts` searches came back empty. Never fails.
    pub async fn resolve(&self, query: &str, max_attempts: usize) -> String {
        let mut query = query.to_string();

        for attempt in 1..=max_attempts {
            match self.attempt(&query).await {
                Ok(Some(url)) => {
                    tracing::debug!(%query, %url, attempt, "image resolved");
                    return url;
                }
                Ok(None) => tracing::debug!(%query, attempt, "no usable image"),
                Err(e) => tracing::warn!(%query, attempt, "image search failed: {}", e),
            }
            query.push_str(RETRY_SUFFIX);
        }

        PLACEHOLDER_IMAGE_URL.to_string()
    }

    async fn attempt(&self, query: &str) -> Result<Option<String>> {
        let titles = self.search.search(query, self.candidate_limit).await?;

        for title in titles.iter().take(self.candidate_limit) {
            match self.search.image_info(title).await {
                Ok(Some(info)) if info.is_usable() => return Ok(Some(info.url)),
                Ok(_) => {}
                Err(e) => tracing::debug!(%title, "image info lookup failed: {}", e),
            }
        }

        Ok(None)
    }
}
