use futures_util::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::Selector;
use std::time::Duration;

use crate::images::{normalize_query, ImageResolver, ImageSearch, ResolvedImage, PLACEHOLDER_IMAGE_URL};
use crate::markup::Document;

pub const RESPONSIVE_IMG_CLASS: &str = "responsive-img";

const BACKGROUND_PLACEHOLDER_MARKERS: &[&str] = &["path/to/your/background.jpg", "placeholder", "your_image_here"];

const HEAD_ASSETS: &str = r#"<style>
img.responsive-img {
    max-width: 100%;
    height: auto;
    display: block;
}
.container, .content-container, .content-section {
    width: 100%;
    overflow: hidden;
}
</style>
<link rel="stylesheet" href="https://stackpath.bootstrapcdn.com/bootstrap/4.5.2/css/bootstrap.min.css">
"#;

const BODY_ASSETS: &str = r#"<script src="https://code.jquery.com/jquery-3.5.1.slim.min.js"></script>
<script src="https://cdn.jsdelivr.net/npm/popper.js@1.16.1/dist/umd/popper.min.js"></script>
<script src="https://stackpath.bootstrapcdn.com/bootstrap/4.5.2/js/bootstrap.min.js"></script>
"#;

static BACKGROUND_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)background-image\s*:\s*url\(\s*['"]?(.*?)['"]?\s*\)"#).unwrap());

/// The placeholder URL of an inline `background-image`, if it is one the
/// model was told to use.
pub fn background_placeholder(style: &str) -> Option<String> {
    let url = BACKGROUND_URL_RE.captures(style)?.get(1)?.as_str().trim();
    let lower = url.to_lowercase();
    BACKGROUND_PLACEHOLDER_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
        .then(|| url.to_string())
}

fn image_targets() -> Selector {
    Selector::parse("img, [style]").unwrap()
}

#[derive(Debug, Clone, PartialEq)]
enum Target {
    Src,
    Background { placeholder: String },
}

#[derive(Debug, Clone)]
struct Job {
    /// Position among the `img, [style]` matches of the parsed page.
    element: usize,
    target: Target,
    query: String,
}

fn plan_jobs(document: &Document, topic: &str) -> Vec<Job> {
    let mut jobs = Vec::new();

    for (element, id) in document.select(&image_targets()).into_iter().enumerate() {
        let alt = document.attr(id, "alt").unwrap_or_default();

        if document.name(id) == Some("img") {
            jobs.push(Job {
                element,
                target: Target::Src,
                query: normalize_query(alt, topic),
            });
        }

        if let Some(placeholder) = document.attr(id, "style").and_then(background_placeholder) {
            jobs.push(Job {
                element,
                target: Target::Background { placeholder },
                query: normalize_query(alt, topic),
            });
        }
    }

    jobs
}

fn rewrite(source: &str, jobs: &[Job], urls: &[String]) -> String {
    let mut document = Document::parse(source);
    let targets = document.select(&image_targets());

    for (job, url) in jobs.iter().zip(urls) {
        let Some(&id) = targets.get(job.element) else {
            continue;
        };
        match &job.target {
            Target::Src => {
                document.set_attr(id, "src", url);
                document.add_class(id, RESPONSIVE_IMG_CLASS);
            }
            Target::Background { placeholder } => {
                let style = document
                    .attr(id, "style")
                    .unwrap_or_default()
                    .replace(placeholder.as_str(), url);
                document.set_attr(id, "style", &style);
            }
        }
    }

    document.append_assets(HEAD_ASSETS, BODY_ASSETS);
    document.to_html()
}

#[derive(Debug, Clone)]
pub struct ProcessedPage {
    pub html: String,
    pub images: Vec<ResolvedImage>,
}

pub struct PagePostProcessor<S> {
    resolver: ImageResolver<S>,
    max_attempts: usize,
    concurrency: usize,
    resolve_timeout: Duration,
    page_timeout: Duration,
}

impl<S: ImageSearch> PagePostProcessor<S> {
    pub fn new(resolver: ImageResolver<S>, max_attempts: usize) -> Self {
        PagePostProcessor {
            resolver,
            max_attempts,
            concurrency: 8,
            resolve_timeout: Duration::from_secs(20),
            page_timeout: Duration::from_secs(90),
        }
    }

    pub fn with_limits(mut self, concurrency: usize, resolve_timeout: Duration, page_timeout: Duration) -> Self {
        self.concurrency = concurrency.max(1);
        self.resolve_timeout = resolve_timeout;
        self.page_timeout = page_timeout;
        self
    }

    /// Replaces placeholder images in `html` with resolved ones and injects
    /// the baseline assets. Always returns a complete document.
    pub async fn process(&self, html: &str, topic: &str) -> ProcessedPage {
        // The parsed tree is not Send, so it never lives across an await.
        let jobs = plan_jobs(&Document::parse(html), topic);
        tracing::info!(images = jobs.len(), %topic, "resolving page images");

        let urls = self.resolve_all(jobs.iter().map(|job| job.query.clone()).collect()).await;
        let html = rewrite(html, &jobs, &urls);

        let images = jobs
            .into_iter()
            .zip(urls)
            .map(|(job, url)| ResolvedImage { query: job.query, url })
            .collect();

        ProcessedPage { html, images }
    }

    /// Runs at most `concurrency` resolutions at a time, each under
    /// `resolve_timeout` and all under `page_timeout`. Anything that does not
    /// finish in time gets the placeholder.
    async fn resolve_all(&self, queries: Vec<String>) -> Vec<String> {
        let mut urls: Vec<Option<String>> = vec![None; queries.len()];
        if queries.is_empty() {
            return Vec::new();
        }

        let resolver = &self.resolver;
        let max_attempts = self.max_attempts;
        let per_call = self.resolve_timeout;

        let mut results = stream::iter(queries.into_iter().enumerate())
            .map(move |(index, query)| async move {
                let url = match tokio::time::timeout(per_call, resolver.resolve(&query, max_attempts)).await {
                    Ok(url) => url,
                    Err(_) => {
                        tracing::warn!(%query, "image resolution timed out");
                        PLACEHOLDER_IMAGE_URL.to_string()
                    }
                };
                (index, url)
            })
            .buffer_unordered(self.concurrency);

        let finished = tokio::time::timeout(self.page_timeout, async {
            while let Some((index, url)) = results.next().await {
                urls[index] = Some(url);
            }
        })
        .await;

        if finished.is_err() {
            let pending = urls.iter().filter(|u| u.is_none()).count();
            tracing::warn!(pending, "page image deadline reached, cancelling remaining lookups");
        }

        urls.into_iter()
            .map(|url| url.unwrap_or_else(|| PLACEHOLDER_IMAGE_URL.to_string()))
            .collect()
    }
}
