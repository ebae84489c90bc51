//! Chart repository definitions
//!
//! Repositories come from the worker configuration; there is no on-disk
//! repository registry of its own.

use serde::{Deserialize, Serialize};

use crate::error::{RepoError, Result};

/// Repository definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    /// Unique name, matched against `ReleaseRequest::repo_name`
    pub name: String,

    /// `http(s)://`, `oci://` or `file://` URL
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl Repository {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Result<Self> {
        let repo = Self {
            name: name.into(),
            url: url.into(),
            username: None,
            password: None,
        };
        repo.repo_type()?;
        Ok(repo)
    }

    pub fn with_basic_auth(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn repo_type(&self) -> Result<RepositoryType> {
        RepositoryType::detect(&self.url)
    }

    /// `<url>/index.yaml`
    pub fn index_url(&self) -> String {
        format!("{}/index.yaml", self.url.trim_end_matches('/'))
    }

    /// Resolve a chart URL from the index against the repository URL
    pub fn resolve_url(&self, url: &str) -> String {
        if url.contains("://") {
            url.to_string()
        } else {
            format!(
                "{}/{}",
                self.url.trim_end_matches('/'),
                url.trim_start_matches('/')
            )
        }
    }
}

/// Repository type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RepositoryType {
    /// Helm repository serving `index.yaml`
    #[default]
    Http,

    /// OCI-compliant registry
    Oci,

    /// Helm repository laid out on the local filesystem
    File,
}

impl RepositoryType {
    /// Auto-detect repository type from URL
    pub fn detect(url: &str) -> Result<Self> {
        if url.starts_with("oci://") {
            Ok(RepositoryType::Oci)
        } else if url.starts_with("file://") || url.starts_with('/') {
            Ok(RepositoryType::File)
        } else if url.starts_with("http://") || url.starts_with("https://") {
            Ok(RepositoryType::Http)
        } else {
            Err(RepoError::InvalidRepositoryUrl {
                url: url.to_string(),
                reason: "URL must start with http://, https://, oci://, file:// or /".to_string(),
            })
        }
    }
}

/// The set of repositories the worker knows about
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default)]
    pub repositories: Vec<Repository>,
}

impl RepositoryConfig {
    pub fn new(repositories: Vec<Repository>) -> Self {
        Self { repositories }
    }

    /// Get a repository by name
    pub fn get(&self, name: &str) -> Result<&Repository> {
        self.repositories
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| RepoError::RepositoryNotFound {
                name: name.to_string(),
            })
    }

    /// Credentials configured for an OCI registry host, if any
    pub fn credentials_for_registry(&self, registry: &str) -> Option<(&str, &str)> {
        self.repositories
            .iter()
            .filter(|r| {
                r.url
                    .trim_start_matches("oci://")
                    .split('/')
                    .next()
                    .is_some_and(|host| host == registry)
            })
            .find_map(|r| Some((r.username.as_deref()?, r.password.as_deref()?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_type_detection() {
        assert_eq!(
            RepositoryType::detect("https://charts.example.com/stable").unwrap(),
            RepositoryType::Http
        );
        assert_eq!(
            RepositoryType::detect("oci://harbor.local/charts").unwrap(),
            RepositoryType::Oci
        );
        assert_eq!(
            RepositoryType::detect("/srv/charts").unwrap(),
            RepositoryType::File
        );
        assert!(RepositoryType::detect("stable").is_err());
    }

    #[test]
    fn test_resolve_url() {
        let repo = Repository::new("stable", "https://charts.example.com/stable/").unwrap();
        assert_eq!(repo.index_url(), "https://charts.example.com/stable/index.yaml");
        assert_eq!(
            repo.resolve_url("charts/nginx-1.0.0.tgz"),
            "https://charts.example.com/stable/charts/nginx-1.0.0.tgz"
        );
        assert_eq!(repo.resolve_url("https://cdn/x.tgz"), "https://cdn/x.tgz");
    }

    #[test]
    fn test_config_lookup() {
        let config = RepositoryConfig::new(vec![
            Repository::new("stable", "https://charts.example.com").unwrap(),
            Repository::new("harbor", "oci://harbor.local/charts")
                .unwrap()
                .with_basic_auth("admin", "secret"),
        ]);
        assert!(config.get("stable").is_ok());
        assert!(config.get("missing").unwrap_err().is_not_found());
        assert_eq!(
            config.credentials_for_registry("harbor.local"),
            Some(("admin", "secret"))
        );
        assert_eq!(config.credentials_for_registry("docker.io"), None);
    }

    #[test]
    fn test_config_yaml() {
        let yaml = "repositories:\n  - name: stable\n    url: https://charts.example.com\n    username: u\n    password: p\n";
        let config: RepositoryConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.repositories[0].username.as_deref(), Some("u"));
    }
}
