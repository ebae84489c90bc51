//! OCI chart images
//!
//! A chart image is a Helm chart pushed to an OCI registry; the chart
//! archive is the layer with the Helm content media type.

use oci_distribution::Reference;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol};
use oci_distribution::secrets::RegistryAuth;
use tracing::debug;

use crate::config::RepositoryConfig;
use crate::error::{RepoError, Result};

/// Media types for Helm charts in OCI
pub mod media_types {
    pub const HELM_CONFIG: &str = "application/vnd.cncf.helm.config.v1+json";
    pub const HELM_CONTENT: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";
}

/// Parsed `registry/repository[:tag][@digest]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OciReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl OciReference {
    pub fn parse(s: &str) -> Result<Self> {
        let clean = s
            .trim_start_matches("oci://")
            .trim_start_matches("https://")
            .trim_start_matches("http://");

        let (registry, rest) = clean
            .split_once('/')
            .filter(|(registry, rest)| !registry.is_empty() && !rest.is_empty())
            .ok_or_else(|| RepoError::InvalidOciReference {
                reference: s.to_string(),
            })?;

        let (repo_tag, digest) = match rest.rsplit_once('@') {
            Some((repo_tag, digest)) => (repo_tag, Some(digest.to_string())),
            None => (rest, None),
        };
        let (repository, tag) = match repo_tag.rsplit_once(':') {
            Some((repository, tag)) => (repository.to_string(), Some(tag.to_string())),
            None => (repo_tag.to_string(), None),
        };

        Ok(Self {
            registry: registry.to_string(),
            repository,
            tag,
            digest,
        })
    }

    pub fn to_oci_string(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

/// OCI registry client for chart images
pub struct OciRegistry {
    client: Client,
    repositories: RepositoryConfig,
}

impl OciRegistry {
    pub fn new(repositories: RepositoryConfig) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            repositories,
        }
    }

    fn auth_for(&self, reference: &OciReference) -> RegistryAuth {
        match self.repositories.credentials_for_registry(&reference.registry) {
            Some((username, password)) => {
                RegistryAuth::Basic(username.to_string(), password.to_string())
            }
            None => RegistryAuth::Anonymous,
        }
    }

    /// Pull a chart image and return the chart archive bytes
    pub async fn pull(&self, image: &str) -> Result<Vec<u8>> {
        let parsed = OciReference::parse(image)?;
        let reference: Reference =
            parsed
                .to_oci_string()
                .parse()
                .map_err(|e| RepoError::InvalidOciReference {
                    reference: format!("{}: {}", image, e),
                })?;

        debug!(image = %image, "pulling chart image");
        let image_data = self
            .client
            .pull(
                &reference,
                &self.auth_for(&parsed),
                vec![media_types::HELM_CONFIG, media_types::HELM_CONTENT],
            )
            .await
            .map_err(|e| RepoError::OciError {
                message: format!("Failed to pull {}: {}", image, e),
            })?;

        image_data
            .layers
            .into_iter()
            .find(|l| l.media_type == media_types::HELM_CONTENT)
            .map(|l| l.data)
            .ok_or_else(|| RepoError::OciError {
                message: format!("No chart content layer found in {}", image),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oci_reference_parse() {
        let r = OciReference::parse("oci://harbor.local/charts/zookeeper:6.1.0").unwrap();
        assert_eq!(r.registry, "harbor.local");
        assert_eq!(r.repository, "charts/zookeeper");
        assert_eq!(r.tag.as_deref(), Some("6.1.0"));
        assert!(r.digest.is_none());

        let r = OciReference::parse("harbor.local/zk:1.0@sha256:abc").unwrap();
        assert_eq!(r.tag.as_deref(), Some("1.0"));
        assert_eq!(r.digest.as_deref(), Some("sha256:abc"));
        assert_eq!(r.to_oci_string(), "harbor.local/zk:1.0@sha256:abc");

        assert!(OciReference::parse("zookeeper").is_err());
    }
}
