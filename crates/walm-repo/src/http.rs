//! Helm index repositories
//!
//! Fetches `index.yaml`, resolves a chart version and downloads its archive.
//! `file://` repositories use the same layout on the local filesystem.

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::{Repository, RepositoryType};
use crate::error::{RepoError, Result};
use crate::index::{ChartEntry, RepositoryIndex};

/// Helm index repository client
#[derive(Debug, Clone)]
pub struct HttpRepository {
    repo: Repository,
    client: reqwest::Client,
}

impl HttpRepository {
    pub fn new(repo: Repository, client: reqwest::Client) -> Self {
        Self { repo, client }
    }

    pub fn name(&self) -> &str {
        &self.repo.name
    }

    /// Fetch and parse the repository index
    pub async fn fetch_index(&self) -> Result<RepositoryIndex> {
        let data = self.get_bytes(&self.repo.index_url()).await?;
        RepositoryIndex::from_bytes(&data)
    }

    /// Download the archive of `name` at `version` (latest when empty)
    pub async fn fetch_chart(&self, name: &str, version: &str) -> Result<Vec<u8>> {
        let index = self.fetch_index().await?;
        let entry = index.resolve(&self.repo.name, name, version)?;
        debug!(repo = %self.repo.name, chart = %name, version = %entry.version, "downloading chart");
        self.download(entry).await
    }

    /// Download a chart archive, verifying its digest when the index has one
    pub async fn download(&self, entry: &ChartEntry) -> Result<Vec<u8>> {
        let url = entry.download_url().ok_or_else(|| RepoError::ChartNotFound {
            name: entry.name.clone(),
            repo: self.repo.name.clone(),
        })?;
        let data = self.get_bytes(&self.repo.resolve_url(url)).await?;

        if let Some(expected) = &entry.digest {
            let actual = compute_digest(&data);
            if !digest_matches(expected, &actual) {
                return Err(RepoError::IntegrityCheckFailed {
                    name: entry.name.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(data)
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        if RepositoryType::detect(url)? == RepositoryType::File {
            let path = url.trim_start_matches("file://");
            return Ok(tokio::fs::read(path).await?);
        }

        let mut request = self.client.get(url);
        if let Some(username) = &self.repo.username {
            request = request.basic_auth(username, self.repo.password.as_deref());
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RepoError::HttpError {
                status: status.as_u16(),
                message: format!("GET {} returned {}", url, status),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// SHA256 digest of data, `sha256:<hex>`
fn compute_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Compare digests ignoring case and `sha256:` / `sha256-` prefixes
fn digest_matches(expected: &str, actual: &str) -> bool {
    let normalize = |d: &str| {
        d.trim()
            .to_lowercase()
            .replace("sha256:", "")
            .replace("sha256-", "")
    };
    normalize(expected) == normalize(actual)
}
