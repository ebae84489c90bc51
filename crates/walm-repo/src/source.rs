//! Chart source selection
//!
//! Inline chart files win over a chart image, which wins over repository
//! coordinates.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;
use walm_core::chart::pack_archive;
use walm_core::{ChartFile, LoadedChart};

use crate::config::{RepositoryConfig, RepositoryType};
use crate::error::{RepoError, Result};
use crate::http::HttpRepository;
use crate::oci::OciRegistry;

/// Where a chart comes from
#[derive(Debug, Clone, Default)]
pub struct ChartRequest {
    pub repo_name: String,
    pub chart_name: String,
    pub chart_version: String,
    pub chart_image: String,
    pub chart_files: Option<Vec<ChartFile>>,
}

impl ChartRequest {
    pub fn from_repo(repo: &str, name: &str, version: &str) -> Self {
        Self {
            repo_name: repo.to_string(),
            chart_name: name.to_string(),
            chart_version: version.to_string(),
            ..Default::default()
        }
    }

    pub fn from_image(image: &str) -> Self {
        Self {
            chart_image: image.to_string(),
            ..Default::default()
        }
    }

    pub fn from_files(files: Vec<ChartFile>) -> Self {
        Self {
            chart_files: Some(files),
            ..Default::default()
        }
    }

    fn describe(&self) -> String {
        if self.chart_files.is_some() {
            "inline chart files".to_string()
        } else if !self.chart_image.is_empty() {
            format!("image {}", self.chart_image)
        } else {
            format!("{}/{}:{}", self.repo_name, self.chart_name, self.chart_version)
        }
    }
}

/// Anything able to produce a loaded chart
#[async_trait]
pub trait ChartSource: Send + Sync {
    async fn load(&self, request: &ChartRequest) -> Result<LoadedChart>;
}

/// Chart source backed by the configured repositories and registries
pub struct RepoChartSource {
    repositories: RepositoryConfig,
    client: reqwest::Client,
    registry: OciRegistry,
}

impl RepoChartSource {
    pub fn new(repositories: RepositoryConfig) -> Self {
        Self {
            registry: OciRegistry::new(repositories.clone()),
            repositories,
            client: reqwest::Client::new(),
        }
    }

    async fn fetch_from_repo(&self, request: &ChartRequest) -> Result<Vec<u8>> {
        let repo = self.repositories.get(&request.repo_name)?;
        match repo.repo_type()? {
            RepositoryType::Oci => {
                let tag = if request.chart_version.is_empty() {
                    "latest"
                } else {
                    request.chart_version.as_str()
                };
                let image = format!(
                    "{}/{}:{}",
                    repo.url.trim_end_matches('/'),
                    request.chart_name,
                    tag
                );
                self.registry.pull(&image).await
            }
            RepositoryType::Http | RepositoryType::File => {
                HttpRepository::new(repo.clone(), self.client.clone())
                    .fetch_chart(&request.chart_name, &request.chart_version)
                    .await
            }
        }
    }
}

#[async_trait]
impl ChartSource for RepoChartSource {
    async fn load(&self, request: &ChartRequest) -> Result<LoadedChart> {
        debug!(source = %request.describe(), "loading chart");
        if let Some(files) = &request.chart_files {
            return Ok(LoadedChart::from_files(files.clone())?);
        }
        let bytes = if !request.chart_image.is_empty() {
            self.registry.pull(&request.chart_image).await?
        } else if !request.chart_name.is_empty() {
            self.fetch_from_repo(request).await?
        } else {
            return Err(RepoError::NoSource {
                message: "request names neither chart files, a chart image nor a chart name"
                    .to_string(),
            });
        };
        Ok(LoadedChart::from_archive(&bytes)?)
    }
}

/// In-memory chart source keyed by repo coordinates or image reference
#[derive(Clone, Default)]
pub struct MemoryChartSource {
    archives: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    loads: Arc<AtomicUsize>,
}

impl MemoryChartSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn repo_key(repo: &str, name: &str, version: &str) -> String {
        format!("repo:{}/{}:{}", repo, name, version)
    }

    fn image_key(image: &str) -> String {
        format!("image:{}", image)
    }

    fn insert(&self, key: String, archive: Vec<u8>) {
        if let Ok(mut archives) = self.archives.write() {
            archives.insert(key, archive);
        }
    }

    /// Register a chart under repository coordinates
    pub fn add_chart(&self, repo: &str, name: &str, version: &str, files: &[ChartFile]) -> Result<()> {
        let archive = pack_archive(name, files)?;
        self.insert(Self::repo_key(repo, name, version), archive);
        Ok(())
    }

    /// Register a chart under an image reference
    pub fn add_image(&self, image: &str, files: &[ChartFile]) -> Result<()> {
        let name = image.rsplit('/').next().unwrap_or(image);
        let archive = pack_archive(name.split(':').next().unwrap_or(name), files)?;
        self.insert(Self::image_key(image), archive);
        Ok(())
    }

    /// Number of successful loads so far
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn archive(&self, key: &str) -> Option<Vec<u8>> {
        self.archives.read().ok()?.get(key).cloned()
    }
}

#[async_trait]
impl ChartSource for MemoryChartSource {
    async fn load(&self, request: &ChartRequest) -> Result<LoadedChart> {
        let chart = if let Some(files) = &request.chart_files {
            LoadedChart::from_files(files.clone())?
        } else if !request.chart_image.is_empty() {
            let bytes = self
                .archive(&Self::image_key(&request.chart_image))
                .ok_or_else(|| RepoError::ChartNotFound {
                    name: request.chart_image.clone(),
                    repo: "registry".to_string(),
                })?;
            LoadedChart::from_archive(&bytes)?
        } else {
            let key = Self::repo_key(&request.repo_name, &request.chart_name, &request.chart_version);
            let bytes = self.archive(&key).ok_or_else(|| RepoError::VersionNotFound {
                name: request.chart_name.clone(),
                version: request.chart_version.clone(),
                repo: request.repo_name.clone(),
            })?;
            LoadedChart::from_archive(&bytes)?
        };
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(chart)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(name: &str) -> Vec<ChartFile> {
        vec![ChartFile::new(
            "Chart.yaml",
            format!("name: {}\nversion: 1.0.0\n", name),
        )]
    }

    #[tokio::test]
    async fn test_memory_source_priority() {
        let source = MemoryChartSource::new();
        source.add_chart("stable", "repo-chart", "1.0.0", &files("repo-chart")).unwrap();
        source.add_image("harbor.local/img-chart:1.0.0", &files("img-chart")).unwrap();

        let mut request = ChartRequest::from_repo("stable", "repo-chart", "1.0.0");
        assert_eq!(source.load(&request).await.unwrap().metadata.name, "repo-chart");

        request.chart_image = "harbor.local/img-chart:1.0.0".to_string();
        assert_eq!(source.load(&request).await.unwrap().metadata.name, "img-chart");

        request.chart_files = Some(files("inline"));
        assert_eq!(source.load(&request).await.unwrap().metadata.name, "inline");
        assert_eq!(source.load_count(), 3);
    }

    #[tokio::test]
    async fn test_memory_source_miss_is_not_found() {
        let source = MemoryChartSource::new();
        let err = source
            .load(&ChartRequest::from_repo("stable", "nope", "1.0.0"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_repo_source_requires_a_source() {
        let source = RepoChartSource::new(RepositoryConfig::default());
        let err = source.load(&ChartRequest::default()).await.unwrap_err();
        assert!(matches!(err, RepoError::NoSource { .. }));

        let err = source
            .load(&ChartRequest::from_repo("unknown", "zk", "1.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::RepositoryNotFound { .. }));
    }
}
