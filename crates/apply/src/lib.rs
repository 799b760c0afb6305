//! Rudder apply: validate (dry-run), apply and remove manifests.
//!
//! The reconciliation loop only sees the [`Applier`] trait. [`KubeApplier`] is the
//! default backend and talks server-side apply to the cluster.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use kube::api::{DeleteParams, Patch, PatchParams};
use metrics::{counter, histogram};
use rudder_core::{Gvk, RudderError, RudderResult};
use rudder_kubehub::ApiResolver;
use rudder_manifest::ManifestObject;
use serde_json::Value as Json;
use tracing::{debug, info};

pub const FIELD_MANAGER: &str = "rudder";

/// Declarative apply backend. Every method takes a multi-document YAML stream.
#[async_trait::async_trait]
pub trait Applier: Send + Sync {
    /// Validate the manifest without persisting anything.
    async fn validate_apply(&self, manifest: &[u8]) -> RudderResult<()>;

    async fn apply(&self, manifest: &[u8]) -> RudderResult<()>;

    /// Delete the manifest's objects. Objects that are already gone count as removed.
    async fn remove(&self, manifest: &[u8]) -> RudderResult<()>;
}

/// Server-side apply against the live cluster.
pub struct KubeApplier {
    resolver: Arc<ApiResolver>,
    timeout: Duration,
}

impl KubeApplier {
    pub fn new(resolver: Arc<ApiResolver>, timeout: Duration) -> Self {
        Self { resolver, timeout }
    }

    async fn patch_all(&self, manifest: &[u8], dry_run: bool) -> Result<usize> {
        let objects = rudder_manifest::split_documents(manifest).context("parsing manifest")?;
        if !dry_run {
            for obj in &objects {
                self.patch_one(obj, false).await?;
            }
            return Ok(objects.len());
        }
        for (obj, check) in objects.iter().zip(validation_plan(&objects)) {
            match check {
                Validation::Server => self.patch_one(obj, true).await?,
                Validation::Local => {
                    counter!("apply_dry_local", 1u64);
                    debug!(gvk = %obj.gvk, name = %obj.name, "depends on an earlier object; server dry run skipped");
                }
            }
        }
        Ok(objects.len())
    }

    async fn patch_one(&self, obj: &ManifestObject, dry_run: bool) -> Result<()> {
        let t0 = Instant::now();
        counter!("apply_attempts", 1u64);
        let (api, ns) = self.resolver.api_for(&obj.object_ref()).await?;
        let mut body = obj.body.clone();
        ensure_metadata(&mut body, &obj.name, &ns);

        // Force so fields last written by other managers are taken over, same for the dry run.
        let mut pp = PatchParams::apply(FIELD_MANAGER).force();
        if dry_run {
            pp = pp.dry_run();
        }
        let res = tokio::time::timeout(self.timeout, api.patch(&obj.name, &pp, &Patch::Apply(&body)))
            .await
            .map_err(|_| anyhow!("{} {}: timed out after {:?}", obj.gvk, obj.name, self.timeout))?;
        match res {
            Ok(live) => {
                histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                if dry_run {
                    counter!("apply_dry_ok", 1u64);
                } else {
                    counter!("apply_ok", 1u64);
                    debug!(gvk = %obj.gvk, name = %obj.name, ns = %ns, rv = ?live.metadata.resource_version, "applied");
                }
                Ok(())
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                Err(anyhow!("{} {}: server-side apply failed: {}", obj.gvk, obj.name, e))
            }
        }
    }

    async fn delete_all(&self, manifest: &[u8]) -> Result<usize> {
        let objects = rudder_manifest::split_documents(manifest).context("parsing manifest")?;
        let mut deleted = 0usize;
        for obj in &objects {
            if self.delete_one(obj).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Returns false when the object was already absent.
    async fn delete_one(&self, obj: &ManifestObject) -> Result<bool> {
        let (api, ns) = self.resolver.api_for(&obj.object_ref()).await?;
        let res = tokio::time::timeout(self.timeout, api.delete(&obj.name, &DeleteParams::background()))
            .await
            .map_err(|_| anyhow!("{} {}: timed out after {:?}", obj.gvk, obj.name, self.timeout))?;
        match absent_ok(res) {
            Ok(Some(_)) => {
                counter!("remove_ok", 1u64);
                info!(gvk = %obj.gvk, name = %obj.name, ns = %ns, "deleted");
                if is_crd(&obj.gvk) {
                    self.resolver.invalidate();
                }
                Ok(true)
            }
            Ok(None) => {
                debug!(gvk = %obj.gvk, name = %obj.name, ns = %ns, "already absent");
                Ok(false)
            }
            Err(e) => {
                counter!("remove_err", 1u64);
                Err(anyhow!("{} {}: delete failed: {}", obj.gvk, obj.name, e))
            }
        }
    }
}

/// A not-found response means the object is already gone.
fn absent_ok<T>(res: kube::Result<T>) -> kube::Result<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e),
    }
}

/// How one object of a stream is checked before the real apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Validation {
    /// Server-side dry run.
    Server,
    /// Parse checks only. A dry run persists nothing, so an object living in a
    /// namespace, or typed by a CRD, declared earlier in the same stream would
    /// always be refused by the server.
    Local,
}

fn is_crd(gvk: &Gvk) -> bool {
    gvk.group == "apiextensions.k8s.io" && gvk.kind == "CustomResourceDefinition"
}

fn is_namespace(gvk: &Gvk) -> bool {
    gvk.group.is_empty() && gvk.kind == "Namespace"
}

/// Kinds a CRD body declares, one per served version.
fn crd_kinds(body: &Json) -> Vec<Gvk> {
    let spec = &body["spec"];
    let (Some(group), Some(kind)) = (spec["group"].as_str(), spec["names"]["kind"].as_str()) else {
        return Vec::new();
    };
    let mut versions: Vec<&str> = spec["versions"]
        .as_array()
        .map(|vs| vs.iter().filter_map(|v| v["name"].as_str()).collect())
        .unwrap_or_default();
    if let Some(v) = spec["version"].as_str() {
        versions.push(v);
    }
    versions
        .into_iter()
        .map(|version| Gvk { group: group.to_string(), version: version.to_string(), kind: kind.to_string() })
        .collect()
}

fn validation_plan(objects: &[ManifestObject]) -> Vec<Validation> {
    let mut namespaces: HashSet<&str> = HashSet::new();
    let mut kinds: HashSet<Gvk> = HashSet::new();
    let mut plan = Vec::with_capacity(objects.len());
    for obj in objects {
        let in_new_ns = obj.namespace.as_deref().is_some_and(|ns| namespaces.contains(ns));
        plan.push(if in_new_ns || kinds.contains(&obj.gvk) { Validation::Local } else { Validation::Server });
        if is_namespace(&obj.gvk) {
            namespaces.insert(obj.name.as_str());
        } else if is_crd(&obj.gvk) {
            kinds.extend(crd_kinds(&obj.body));
        }
    }
    plan
}

#[async_trait::async_trait]
impl Applier for KubeApplier {
    async fn validate_apply(&self, manifest: &[u8]) -> RudderResult<()> {
        self.patch_all(manifest, true).await.map(|_| ()).map_err(|e| RudderError::DryRun(format!("{:#}", e)))
    }

    async fn apply(&self, manifest: &[u8]) -> RudderResult<()> {
        self.patch_all(manifest, false).await.map(|_| ()).map_err(|e| RudderError::Apply(format!("{:#}", e)))
    }

    async fn remove(&self, manifest: &[u8]) -> RudderResult<()> {
        self.delete_all(manifest).await.map(|_| ()).map_err(|e| RudderError::Remove(format!("{:#}", e)))
    }
}

/// Pin `metadata.name`, and `metadata.namespace` when non-empty, on the apply body.
fn ensure_metadata(v: &mut Json, name: &str, ns: &str) {
    let Some(root) = v.as_object_mut() else { return };
    let meta = root.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new()));
    if let Some(obj) = meta.as_object_mut() {
        obj.insert("name".into(), Json::String(name.to_string()));
        if !ns.is_empty() {
            obj.insert("namespace".into(), Json::String(ns.to_string()));
        }
    }
}
