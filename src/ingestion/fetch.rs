//! Corpus fetching with a filesystem-backed document cache.

use std::path::{Path, PathBuf};

use reqwest::Client;
use tokio::fs;
use url::Url;

use crate::types::{Document, RagError};

/// Filesystem cache for fetched source documents.
///
/// URLs are normalized into deterministic file names under the working
/// directory so repeated ingestion runs reuse previously downloaded corpora
/// instead of hitting the network.
#[derive(Clone, Debug)]
pub struct DocumentCache {
    root: PathBuf,
}

impl DocumentCache {
    /// Creates a cache rooted at the provided path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Computes the cache file path for a specific URL.
    ///
    /// The file name starts with the sanitized host so equal paths on
    /// different hosts never collide in the cache.
    pub fn cache_path(&self, url: &Url) -> PathBuf {
        let mut components: Vec<String> = url
            .path()
            .trim_start_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(sanitize_component)
            .collect();

        if components.is_empty() {
            components.push("index".to_string());
        }

        let path_part = components.join("_");
        let had_extension = Path::new(&path_part).extension().is_some();

        let mut file_name = sanitize_component(url.host_str().unwrap_or("local"));
        file_name.push('_');
        file_name.push_str(&path_part);

        if let Some(query) = url.query() {
            file_name.push('_');
            file_name.push_str(&sanitize_component(query));
        }

        if !had_extension {
            file_name.push_str(".txt");
        }

        self.root.join(file_name)
    }
}

/// Result of fetching a document, indicating whether it came from the cache.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub document: Document,
    pub bytes: usize,
    pub cache_path: Option<PathBuf>,
    pub from_cache: bool,
}

/// Fetches the document behind `url`, optionally persisting it in `cache`.
///
/// A non-success transport response is an error, never empty content, and no
/// retry happens here; the caller owns retry policy. When a cache entry
/// already exists the contents are loaded from disk and no network request is
/// performed.
pub async fn fetch_document(
    client: &Client,
    url: &Url,
    cache: Option<&DocumentCache>,
) -> Result<FetchOutcome, RagError> {
    if let Some(cache) = cache {
        let cache_path = cache.cache_path(url);
        if cache_path.exists() {
            let content = fs::read_to_string(&cache_path).await?;
            let bytes = content.len();
            tracing::debug!(url = %url, path = %cache_path.display(), "document cache hit");
            return Ok(FetchOutcome {
                document: Document::new(url.clone(), content),
                bytes,
                cache_path: Some(cache_path),
                from_cache: true,
            });
        }

        let content = fetch_from_network(client, url).await?;
        if let Some(parent) = cache_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&cache_path, &content).await?;

        let bytes = content.len();
        return Ok(FetchOutcome {
            document: Document::new(url.clone(), content),
            bytes,
            cache_path: Some(cache_path),
            from_cache: false,
        });
    }

    let content = fetch_from_network(client, url).await?;
    let bytes = content.len();
    Ok(FetchOutcome {
        document: Document::new(url.clone(), content),
        bytes,
        cache_path: None,
        from_cache: false,
    })
}

async fn fetch_from_network(client: &Client, url: &Url) -> Result<String, RagError> {
    let response = client.get(url.clone()).send().await?.error_for_status()?;
    Ok(response.text().await?)
}

fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
