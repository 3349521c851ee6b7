//! Source catalog discovery
//!
//! The Receita Federal publishes each monthly release as a `YYYY-MM/`
//! directory of zip archives behind a plain HTML directory index. The
//! [`HttpCatalog`] picks the newest release (or a pinned one) and lists its
//! archives with whatever size and timestamp the index shows.

use crate::error::{PipelineError, Result};
use crate::retry::{retry, RetryOutcome, RetryPolicy};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info};

/// Release name used when the index lists archives without release directories
pub const FLAT_RELEASE: &str = "current";

// Literal patterns, checked by the parsing tests
#[allow(clippy::expect_used)]
static RELEASE_DIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4})-(0[1-9]|1[0-2])$").expect("Invalid release directory regex")
});

/// Apache (`2024-05-19 13:40`) or nginx (`19-May-2024 13:40`) timestamps
#[allow(clippy::expect_used)]
static LISTING_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}(?::\d{2})?|\d{2}-[A-Za-z]{3}-\d{4} \d{2}:\d{2})")
        .expect("Invalid listing timestamp regex")
});

#[allow(clippy::expect_used)]
static LISTING_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(?:\.\d+)?[KMGT]?$").expect("Invalid listing size regex"));

#[allow(clippy::expect_used)]
static LINK: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("Invalid link selector"));

/// One downloadable archive; identity is `name`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFile {
    pub name: String,
    pub url: String,
    pub release: String,
    /// Size shown by the listing; approximate when the index rounds it
    pub remote_size: Option<u64>,
    pub last_modified: Option<String>,
    /// Set once downloaded
    pub local_path: Option<PathBuf>,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, url: impl Into<String>, release: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            release: release.into(),
            remote_size: None,
            last_modified: None,
            local_path: None,
        }
    }

    /// Version marker recorded in the ledger.
    ///
    /// A new timestamp for the same name is a different logical version.
    pub fn version(&self) -> String {
        match &self.last_modified {
            Some(ts) => format!("{}@{}", self.release, ts),
            None => self.release.clone(),
        }
    }
}

#[async_trait]
pub trait SourceCatalog: Send + Sync {
    /// Files in the current release, sorted by name, one per name
    async fn list_available(&self) -> Result<Vec<SourceFile>>;
}

fn normalize(mut files: Vec<SourceFile>) -> Vec<SourceFile> {
    files.sort_by(|a, b| a.name.cmp(&b.name));
    files.dedup_by(|a, b| a.name == b.name);
    files
}

/// Fixed list; for tests and offline runs against pre-fetched archives
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    files: Vec<SourceFile>,
}

impl StaticCatalog {
    pub fn new(files: Vec<SourceFile>) -> Self {
        Self { files }
    }
}

#[async_trait]
impl SourceCatalog for StaticCatalog {
    async fn list_available(&self) -> Result<Vec<SourceFile>> {
        Ok(normalize(self.files.clone()))
    }
}

/// Directory-index catalog over HTTP
pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: Url,
    release: Option<String>,
    retry: RetryPolicy,
}

impl HttpCatalog {
    pub fn new(
        base_url: &str,
        release: Option<String>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cnpj-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PipelineError::Config(format!("HTTP client: {}", e)))?;
        Self::with_client(client, base_url, release, retry)
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: &str,
        release: Option<String>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        Ok(Self {
            client,
            base_url: directory_url(base_url)?,
            release,
            retry,
        })
    }

    async fn fetch_index(&self, url: &Url) -> Result<String> {
        let client = &self.client;
        let outcome = retry(&self.retry, url.as_str(), |_| async move {
            client
                .get(url.clone())
                .send()
                .await?
                .error_for_status()?
                .text()
                .await
        })
        .await;

        match outcome {
            RetryOutcome::Succeeded { value, .. } => Ok(value),
            RetryOutcome::Exhausted { error, attempts } => Err(PipelineError::CatalogUnavailable {
                attempts,
                reason: format!("{}: {}", url, error),
            }),
        }
    }
}

#[async_trait]
impl SourceCatalog for HttpCatalog {
    async fn list_available(&self) -> Result<Vec<SourceFile>> {
        let root = self.fetch_index(&self.base_url).await?;
        let releases = parse_releases(&root);
        debug!(count = releases.len(), "Releases listed");

        let (release, html, dir_url) = match (&self.release, releases.last()) {
            (Some(pinned), _) => {
                if !releases.iter().any(|r| r == pinned) {
                    return Err(PipelineError::CatalogUnavailable {
                        attempts: 1,
                        reason: format!("release {} is not listed at {}", pinned, self.base_url),
                    });
                }
                let url = directory_url(self.base_url.join(pinned).map_err(url_error)?.as_str())?;
                (pinned.clone(), self.fetch_index(&url).await?, url)
            },
            (None, Some(newest)) => {
                let url = directory_url(self.base_url.join(newest).map_err(url_error)?.as_str())?;
                (newest.clone(), self.fetch_index(&url).await?, url)
            },
            (None, None) => (FLAT_RELEASE.to_string(), root, self.base_url.clone()),
        };

        let files = normalize(parse_files(&html, &dir_url, &release));
        info!(release = %release, files = files.len(), "Catalog listed");
        Ok(files)
    }
}

fn url_error(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Config(format!("invalid catalog URL: {}", e))
}

/// Parse a URL and make sure it ends with `/` so relative joins stay inside it
fn directory_url(raw: &str) -> Result<Url> {
    let with_slash = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{}/", raw)
    };
    Url::parse(&with_slash).map_err(url_error)
}

fn last_segment(href: &str) -> &str {
    let path = href.split(['?', '#']).next().unwrap_or(href);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

fn links(document: &Html) -> Vec<ElementRef<'_>> {
    document.select(&LINK).collect()
}

/// Release directories (`YYYY-MM`) in the index, oldest first
pub fn parse_releases(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);

    let mut releases: Vec<String> = links(&document)
        .into_iter()
        .filter_map(|a| a.value().attr("href"))
        .filter(|href| href.split(['?', '#']).next().unwrap_or("").ends_with('/'))
        .map(last_segment)
        .filter(|segment| RELEASE_DIR.is_match(segment))
        .map(str::to_string)
        .collect();

    releases.sort();
    releases.dedup();
    releases
}

/// Text describing one listing entry: the table row (Apache) or the text
/// following the link (nginx `<pre>` listings)
fn entry_text(link: &ElementRef<'_>) -> String {
    if let Some(row) = link
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|e| e.value().name() == "tr")
    {
        return row.text().collect::<Vec<_>>().join(" ");
    }
    link.next_sibling()
        .and_then(|node| node.value().as_text().map(|t| t.trim().to_string()))
        .unwrap_or_default()
}

struct EntryMetadata {
    size: Option<u64>,
    last_modified: Option<String>,
}

fn parse_metadata(text: &str, name: &str) -> EntryMetadata {
    let date = LISTING_TIMESTAMP.find(text).map(|m| m.as_str().to_string());

    let mut rest = text.replace(name, " ");
    let last_modified = date.map(|ts| {
        rest = rest.replace(&ts, " ");
        ts
    });

    let size = rest
        .split_whitespace()
        .filter(|t| LISTING_SIZE.is_match(t))
        .last()
        .and_then(|t| cnpj_common::units::parse_size(t).ok());

    EntryMetadata {
        size,
        last_modified,
    }
}

/// Zip archives listed in a release directory index
pub fn parse_files(html: &str, dir_url: &Url, release: &str) -> Vec<SourceFile> {
    let document = Html::parse_document(html);
    let mut files = Vec::new();

    for link in links(&document) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let name = last_segment(href);
        if !name.to_ascii_lowercase().ends_with(".zip") {
            continue;
        }
        let Ok(url) = dir_url.join(href) else {
            debug!(%href, "Skipping unresolvable link");
            continue;
        };

        let meta = parse_metadata(&entry_text(&link), name);
        files.push(SourceFile {
            name: name.to_string(),
            url: url.to_string(),
            release: release.to_string(),
            remote_size: meta.size,
            last_modified: meta.last_modified,
            local_path: None,
        });
    }

    files
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ROOT: &str = r#"<html><body><table>
        <tr><td><a href="?C=N;O=D">Name</a></td></tr>
        <tr><td><a href="/dados/cnpj/">Parent Directory</a></td></tr>
        <tr><td><a href="2024-04/">2024-04/</a></td><td>2024-04-14 10:00</td><td>-</td></tr>
        <tr><td><a href="2024-05/">2024-05/</a></td><td>2024-05-19 13:40</td><td>-</td></tr>
        <tr><td><a href="temp/">temp/</a></td><td>2024-05-19 13:40</td><td>-</td></tr>
        </table></body></html>"#;

    const APACHE_RELEASE: &str = r#"<html><body><table>
        <tr><td><a href="Socios0.zip">Socios0.zip</a></td><td align="right">2024-05-19 13:41  </td><td align="right">12M</td></tr>
        <tr><td><a href="Cnaes.zip">Cnaes.zip</a></td><td align="right">2024-05-19 13:40  </td><td align="right"> 22K</td></tr>
        <tr><td><a href="LAYOUT.pdf">LAYOUT.pdf</a></td><td>2024-05-19 13:40</td><td>1.1M</td></tr>
        </table></body></html>"#;

    const NGINX_RELEASE: &str = "<html><body><pre><a href=\"../\">../</a>\n\
        <a href=\"Empresas0.zip\">Empresas0.zip</a>                     19-May-2024 13:40           4521987\n\
        <a href=\"Cnaes.zip\">Cnaes.zip</a>                         19-May-2024 13:40             22413\n\
        </pre></body></html>";

    #[test]
    fn test_listing_patterns_compile() {
        assert!(RELEASE_DIR.is_match("2024-05"));
        assert!(!RELEASE_DIR.is_match("2024-13"));
        assert!(LISTING_TIMESTAMP.is_match("19-May-2024 13:40"));
        assert!(LISTING_SIZE.is_match("1.1M"));
        assert_eq!(links(&Html::parse_document(ROOT)).len(), 5);
    }

    #[test]
    fn test_parse_releases_newest_last() {
        assert_eq!(parse_releases(ROOT), vec!["2024-04", "2024-05"]);
        assert!(parse_releases("<html></html>").is_empty());
    }

    #[test]
    fn test_parse_apache_listing() {
        let dir = Url::parse("http://host/dados/2024-05/").unwrap();
        let files = normalize(parse_files(APACHE_RELEASE, &dir, "2024-05"));

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "Cnaes.zip");
        assert_eq!(files[0].url, "http://host/dados/2024-05/Cnaes.zip");
        assert_eq!(files[0].remote_size, Some(22 * 1024));
        assert_eq!(files[0].last_modified.as_deref(), Some("2024-05-19 13:40"));
        assert_eq!(files[0].version(), "2024-05@2024-05-19 13:40");
        assert_eq!(files[1].remote_size, Some(12 * 1024 * 1024));
    }

    #[test]
    fn test_parse_nginx_listing() {
        let dir = Url::parse("http://host/2024-05/").unwrap();
        let files = normalize(parse_files(NGINX_RELEASE, &dir, "2024-05"));

        assert_eq!(files.len(), 2);
        assert_eq!(files[1].name, "Empresas0.zip");
        assert_eq!(files[1].remote_size, Some(4_521_987));
        assert_eq!(files[1].last_modified.as_deref(), Some("19-May-2024 13:40"));
    }

    #[test]
    fn test_version_without_timestamp() {
        let file = SourceFile::new("Cnaes.zip", "http://x/Cnaes.zip", "2024-05");
        assert_eq!(file.version(), "2024-05");
    }

    #[tokio::test]
    async fn test_http_catalog_picks_newest_release() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cnpj/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ROOT))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cnpj/2024-05/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(APACHE_RELEASE))
            .mount(&server)
            .await;

        let catalog = HttpCatalog::new(
            &format!("{}/cnpj", server.uri()),
            None,
            RetryPolicy::immediate(2),
            Duration::from_secs(5),
        )
        .unwrap();

        let first = catalog.list_available().await.unwrap();
        let second = catalog.list_available().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            vec!["Cnaes.zip", "Socios0.zip"]
        );
        assert!(first.iter().all(|f| f.release == "2024-05"));
    }

    #[tokio::test]
    async fn test_http_catalog_unavailable_after_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let catalog = HttpCatalog::new(
            &server.uri(),
            None,
            RetryPolicy::immediate(3),
            Duration::from_secs(5),
        )
        .unwrap();

        let err = catalog.list_available().await.unwrap_err();
        assert!(matches!(err, PipelineError::CatalogUnavailable { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_pinned_release_must_exist() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ROOT))
            .mount(&server)
            .await;

        let catalog = HttpCatalog::new(
            &server.uri(),
            Some("2023-01".into()),
            RetryPolicy::immediate(1),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(catalog.list_available().await.is_err());
    }
}
