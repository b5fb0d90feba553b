use crate::error::{AppManagerError, Result};
use async_trait::async_trait;
use reqwest::header::{IF_MODIFIED_SINCE, LAST_MODIFIED};
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

const LAST_MODIFIED_SUFFIX: &str = ".lastModified";

/// Result of a conditional fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The cached copy is current
    NotModified,
    /// The artifact was written to the destination
    Downloaded { last_modified: Option<String> },
}

/// Fetches remote artifacts into the local cache
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &Url,
        destination: &Path,
        if_modified_since: Option<String>,
    ) -> Result<FetchOutcome>;
}

/// HTTP(S) fetcher
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppManagerError::system(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &Url,
        destination: &Path,
        if_modified_since: Option<String>,
    ) -> Result<FetchOutcome> {
        let download_error = |details: String| AppManagerError::Download {
            url: url.to_string(),
            details,
        };

        let mut request = self.client.get(url.clone());
        if let Some(timestamp) = &if_modified_since {
            request = request.header(IF_MODIFIED_SINCE, timestamp.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| download_error(e.to_string()))?;

        if response.status() == StatusCode::NOT_MODIFIED && destination.exists() {
            return Ok(FetchOutcome::NotModified);
        }
        if !response.status().is_success() {
            return Err(download_error(format!("HTTP status {}", response.status())));
        }

        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| download_error(e.to_string()))?;
        tokio::fs::write(destination, &body).await?;

        Ok(FetchOutcome::Downloaded { last_modified })
    }
}

/// `location` as a remote URL, if it is one
pub fn remote_url(location: &str) -> Option<Url> {
    Url::parse(location)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"))
}

/// Local path named by a `file:` URL
pub fn file_url_path(location: &str) -> Option<PathBuf> {
    Url::parse(location)
        .ok()
        .filter(|url| url.scheme() == "file")
        .and_then(|url| url.to_file_path().ok())
}

fn file_name_for(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .unwrap_or("artifact")
        .to_string()
}

/// Download `url` into `dir`, skipping the transfer when the stored
/// last-modified timestamp is still current
pub async fn download_artifact(fetcher: &dyn ArtifactFetcher, url: &Url, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;

    let file_name = file_name_for(url);
    let destination = dir.join(&file_name);
    let stamp = dir.join(format!("{}{}", file_name, LAST_MODIFIED_SUFFIX));

    let previous = if destination.exists() {
        tokio::fs::read_to_string(&stamp)
            .await
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    } else {
        None
    };

    match fetcher.fetch(url, &destination, previous).await? {
        FetchOutcome::NotModified => {
            debug!("Cached copy of {} is current", url);
        }
        FetchOutcome::Downloaded {
            last_modified: Some(timestamp),
        } => {
            tokio::fs::write(&stamp, timestamp).await?;
            info!("Downloaded {} to {}", url, destination.display());
        }
        FetchOutcome::Downloaded {
            last_modified: None,
        } => {
            let _ = tokio::fs::remove_file(&stamp).await;
            info!("Downloaded {} to {}", url, destination.display());
        }
    }

    Ok(destination)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct ScriptedFetcher {
        seen: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl ArtifactFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            _url: &Url,
            destination: &Path,
            if_modified_since: Option<String>,
        ) -> Result<FetchOutcome> {
            self.seen.lock().push(if_modified_since.clone());
            if if_modified_since.as_deref() == Some("Mon, 01 Jan 2024 00:00:00 GMT") {
                return Ok(FetchOutcome::NotModified);
            }
            tokio::fs::write(destination, b"payload").await?;
            Ok(FetchOutcome::Downloaded {
                last_modified: Some("Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
            })
        }
    }

    #[test]
    fn test_url_detection() {
        assert!(remote_url("https://example.com/apps/shop.war").is_some());
        assert!(remote_url("shop.war").is_none());
        assert!(remote_url("/opt/apps/shop.war").is_none());
        assert_eq!(
            file_url_path("file:///opt/apps/shop.war"),
            Some(PathBuf::from("/opt/apps/shop.war"))
        );
    }

    #[tokio::test]
    async fn test_second_download_is_conditional() {
        let temp = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher {
            seen: Mutex::new(Vec::new()),
        };
        let url = Url::parse("http://repo.local/apps/shop.war").unwrap();

        let first = download_artifact(&fetcher, &url, temp.path()).await.unwrap();
        assert_eq!(first, temp.path().join("shop.war"));
        assert!(temp.path().join("shop.war.lastModified").exists());

        let second = download_artifact(&fetcher, &url, temp.path()).await.unwrap();
        assert_eq!(first, second);

        let seen = fetcher.seen.lock();
        assert_eq!(seen[0], None);
        assert_eq!(seen[1].as_deref(), Some("Mon, 01 Jan 2024 00:00:00 GMT"));
    }
}
