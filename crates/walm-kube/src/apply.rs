//! Apply collaborator
//!
//! Turns rendered manifests into cluster state: parse, run the plugin
//! pipeline each variant asks for, then apply (or return the set on dry-run).

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use walm_core::plugin::extract_plugins;
use walm_core::{K8sObject, ResourceMeta, Values, parse_manifest, to_manifest};

use crate::cluster::ClusterClient;
use crate::error::{Result, WalmError};
use crate::plugins::annotations::{UPGRADE_POLICY, UPGRADE_POLICY_UPGRADE};
use crate::plugins::{PluginContext, PluginRegistry};

/// One render of the chart: the whole release, or one isomate of it
#[derive(Debug, Clone, Default)]
pub struct RenderedVariant {
    pub manifest: String,

    /// Values the variant was rendered with; carries its plugin list
    pub values: Values,
}

impl RenderedVariant {
    pub fn new(manifest: impl Into<String>, values: Values) -> Self {
        Self {
            manifest: manifest.into(),
            values,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyRequest {
    pub namespace: String,
    pub name: String,
    pub variants: Vec<RenderedVariant>,

    /// Manifest of the last successful apply, used for pruning
    pub previous_manifest: Option<String>,
    pub previous_version: u32,
    pub upgrade: bool,
    pub dry_run: bool,
}

/// What the apply layer reports back
#[derive(Debug, Clone, Default)]
pub struct AppliedRelease {
    pub name: String,
    pub namespace: String,
    pub version: u32,

    /// Final manifest, after the plugin pipeline
    pub manifest: String,
    pub objects: Vec<K8sObject>,
    pub resources: Vec<ResourceMeta>,
}

/// Two-phase apply: `plan` runs the plugin pipeline without touching the
/// cluster, `commit` writes a plan. Callers rolling back a failed install
/// delete the planned manifest, which includes plugin-generated objects.
#[async_trait]
pub trait ReleaseApplier: Send + Sync {
    async fn plan(&self, request: &ApplyRequest) -> Result<AppliedRelease>;

    async fn commit(&self, request: &ApplyRequest, planned: AppliedRelease) -> Result<AppliedRelease>;

    /// Plan, then commit unless the request is a dry-run
    async fn apply(&self, request: ApplyRequest) -> Result<AppliedRelease> {
        let planned = self.plan(&request).await?;
        if request.dry_run {
            return Ok(planned);
        }
        self.commit(&request, planned).await
    }

    /// Delete every object of `manifest`; missing objects are ignored
    async fn delete(&self, namespace: &str, name: &str, manifest: &str) -> Result<()>;
}

/// Applier over a [`ClusterClient`] and a [`PluginRegistry`]
#[derive(Clone)]
pub struct ManifestApplier {
    cluster: Arc<dyn ClusterClient>,
    registry: PluginRegistry,
}

impl ManifestApplier {
    pub fn new(cluster: Arc<dyn ClusterClient>, registry: PluginRegistry) -> Self {
        Self { cluster, registry }
    }

    /// Parse each variant and run its plugins; first occurrence of a
    /// kind/namespace/name wins
    async fn transform(&self, request: &ApplyRequest) -> Result<Vec<K8sObject>> {
        let ctx = PluginContext::new(&request.name, &request.namespace, self.cluster.clone());
        let mut seen = HashSet::new();
        let mut objects = Vec::new();

        for variant in &request.variants {
            let plugins = extract_plugins(&variant.values)?;
            let parsed = parse_manifest(&variant.manifest)?;
            let transformed = self.registry.run_pipeline(&ctx, &plugins, parsed).await?;
            for mut object in transformed {
                if object.namespace().is_none() {
                    object.set_namespace(&request.namespace);
                }
                if seen.insert(ResourceMeta::of(&object, &request.namespace)) {
                    objects.push(object);
                }
            }
        }
        Ok(objects)
    }

    fn apply_error(request: &ApplyRequest, err: WalmError) -> WalmError {
        WalmError::Apply {
            namespace: request.namespace.clone(),
            name: request.name.clone(),
            message: err.to_string(),
        }
    }

    async fn prune(&self, request: &ApplyRequest, keep: &HashSet<ResourceMeta>) -> Result<()> {
        let Some(previous) = request.previous_manifest.as_deref() else {
            return Ok(());
        };
        for object in parse_manifest(previous)? {
            let resource = ResourceMeta::of(&object, &request.namespace);
            if !keep.contains(&resource) {
                debug!(kind = %resource.kind, name = %resource.name, "pruning object dropped from release");
                self.cluster.delete_object(&resource).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ReleaseApplier for ManifestApplier {
    async fn plan(&self, request: &ApplyRequest) -> Result<AppliedRelease> {
        let objects = self.transform(request).await?;
        let resources: Vec<ResourceMeta> = objects
            .iter()
            .map(|o| ResourceMeta::of(o, &request.namespace))
            .collect();
        let manifest = to_manifest(&objects)?;

        Ok(AppliedRelease {
            name: request.name.clone(),
            namespace: request.namespace.clone(),
            version: request.previous_version + 1,
            manifest,
            objects,
            resources,
        })
    }

    async fn commit(&self, request: &ApplyRequest, applied: AppliedRelease) -> Result<AppliedRelease> {
        for (object, resource) in applied.objects.iter().zip(&applied.resources) {
            if request.upgrade && object.annotation(UPGRADE_POLICY) == Some(UPGRADE_POLICY_UPGRADE) {
                let existing = self
                    .cluster
                    .get_object(resource)
                    .await
                    .map_err(|e| Self::apply_error(request, e))?;
                if existing.is_some() {
                    debug!(kind = %resource.kind, name = %resource.name, "keeping existing object on upgrade");
                    continue;
                }
            }
            self.cluster
                .apply_object(&request.namespace, object)
                .await
                .map_err(|e| Self::apply_error(request, e))?;
        }

        let keep: HashSet<ResourceMeta> = applied.resources.iter().cloned().collect();
        self.prune(request, &keep)
            .await
            .map_err(|e| Self::apply_error(request, e))?;

        info!(
            namespace = %request.namespace,
            release = %request.name,
            version = applied.version,
            objects = applied.objects.len(),
            "release applied"
        );
        Ok(applied)
    }

    async fn delete(&self, namespace: &str, name: &str, manifest: &str) -> Result<()> {
        let objects = parse_manifest(manifest)?;
        let mut errors = Vec::new();
        for object in objects.iter().rev() {
            let resource = ResourceMeta::of(object, namespace);
            if let Err(e) = self.cluster.delete_object(&resource).await {
                warn!(kind = %resource.kind, name = %resource.name, error = %e, "failed to delete object");
                errors.push(format!("{} {}: {}", resource.kind, resource.name, e));
            }
        }
        if !errors.is_empty() {
            return Err(WalmError::Aggregate { errors });
        }
        info!(namespace = %namespace, release = %name, objects = objects.len(), "release objects deleted");
        Ok(())
    }
}
