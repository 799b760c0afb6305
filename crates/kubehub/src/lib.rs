//! Rudder kubehub – cluster client, API resource resolution and state observation

#![forbid(unsafe_code)]

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    Client,
};
use metrics::counter;
use rudder_core::{Gvk, ObjectRef, Observation, ResourceId, State};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::{debug, warn};

/// Build a client from in-cluster config, falling back to the local kubeconfig.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client")
}

/// Resolves GVKs to served API resources, caching lookups for the life of the process.
pub struct ApiResolver {
    client: Client,
    cache: Mutex<FxHashMap<Gvk, (ApiResource, bool)>>,
}

impl ApiResolver {
    pub fn new(client: Client) -> Self {
        Self { client, cache: Mutex::new(FxHashMap::default()) }
    }

    /// Namespace used for namespaced objects whose manifest leaves it out.
    pub fn default_namespace(&self) -> &str { self.client.default_namespace() }

    /// Returns the API resource and whether it is namespaced.
    pub async fn resolve(&self, gvk: &Gvk) -> Result<(ApiResource, bool)> {
        let cached = self.cache.lock().unwrap_or_else(|e| e.into_inner()).get(gvk).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }
        let kgvk = GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
        let (ar, caps) = discovery::pinned_kind(&self.client, &kgvk)
            .await
            .map_err(|e| anyhow!("GVK not served: {}: {}", gvk, e))?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(gvk = %gvk, plural = %ar.plural, namespaced, "resolved api resource");
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(gvk.clone(), (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }

    /// Drop cached resolutions once a CRD is removed.
    pub fn invalidate(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Dynamic API handle for an object, plus the namespace it will live in
    /// (empty for cluster-scoped kinds).
    pub async fn api_for(&self, target: &ObjectRef) -> Result<(Api<DynamicObject>, String)> {
        let (ar, namespaced) = self.resolve(&target.gvk).await?;
        if namespaced {
            let ns = target.namespace.clone().unwrap_or_else(|| self.default_namespace().to_string());
            Ok((Api::namespaced_with(self.client.clone(), &ns, &ar), ns))
        } else {
            Ok((Api::all_with(self.client.clone(), &ar), String::new()))
        }
    }
}

/// Source of per-resource state observations.
#[async_trait::async_trait]
pub trait Observer: Send + Sync {
    /// Observe each target; targets that cannot be looked up are left out.
    async fn observe(&self, targets: &[ObjectRef]) -> Vec<Observation>;
}

/// Observer reading live objects through the kube API.
pub struct KubeObserver {
    resolver: std::sync::Arc<ApiResolver>,
    timeout: Duration,
}

impl KubeObserver {
    pub fn new(resolver: std::sync::Arc<ApiResolver>, timeout: Duration) -> Self {
        Self { resolver, timeout }
    }

    async fn observe_one(&self, target: &ObjectRef) -> Result<Observation> {
        let (api, ns) = self.resolver.api_for(target).await?;
        let id = ResourceId::new(&target.gvk.kind, &target.name, ns);
        let live = tokio::time::timeout(self.timeout, api.get_opt(&target.name))
            .await
            .map_err(|_| anyhow!("timed out after {:?}", self.timeout))??;
        let state = match live {
            None => State::Missing,
            Some(obj) => {
                let raw = serde_json::to_value(&obj).context("serializing DynamicObject")?;
                state_for(&target.gvk.kind, &raw)
            }
        };
        Ok(Observation::new(id, state))
    }
}

#[async_trait::async_trait]
impl Observer for KubeObserver {
    async fn observe(&self, targets: &[ObjectRef]) -> Vec<Observation> {
        let mut out = Vec::with_capacity(targets.len());
        for target in targets {
            match self.observe_one(target).await {
                Ok(o) => out.push(o),
                Err(e) => {
                    counter!("observe_err", 1u64);
                    warn!(gvk = %target.gvk, name = %target.name, error = %e, "observation failed; skipping resource this tick");
                }
            }
        }
        out
    }
}

fn int_at(v: &Json, path: &[&str]) -> Option<i64> {
    path.iter().try_fold(v, |cur, key| cur.get(*key))?.as_i64()
}

fn str_at<'a>(v: &'a Json, path: &[&str]) -> Option<&'a str> {
    path.iter().try_fold(v, |cur, key| cur.get(*key))?.as_str()
}

fn replica_state(desired: i64, ready: i64) -> State {
    if ready >= desired {
        State::Ready
    } else if ready > 0 {
        State::Degraded
    } else {
        State::Unavailable
    }
}

fn load_balancer_state(v: &Json) -> State {
    let assigned = v
        .get("status")
        .and_then(|s| s.get("loadBalancer"))
        .and_then(|lb| lb.get("ingress"))
        .and_then(|i| i.as_array())
        .map_or(false, |i| !i.is_empty());
    if assigned { State::Ready } else { State::Unavailable }
}

fn pod_state(v: &Json) -> State {
    match str_at(v, &["status", "phase"]) {
        Some("Running") => {
            let containers = v.get("status").and_then(|s| s.get("containerStatuses")).and_then(|c| c.as_array());
            let all_ready = containers.map_or(false, |cs| {
                !cs.is_empty() && cs.iter().all(|c| c.get("ready").and_then(|r| r.as_bool()).unwrap_or(false))
            });
            if all_ready { State::Ready } else { State::Degraded }
        }
        Some("Succeeded") => State::Ready,
        _ => State::Unavailable,
    }
}

/// Derive the state of an existing object from its body.
pub fn state_for(kind: &str, obj: &Json) -> State {
    match kind {
        "Deployment" | "StatefulSet" | "ReplicaSet" => {
            let desired = int_at(obj, &["spec", "replicas"]).unwrap_or(1);
            let ready = int_at(obj, &["status", "readyReplicas"]).unwrap_or(0);
            replica_state(desired, ready)
        }
        "DaemonSet" => {
            let desired = int_at(obj, &["status", "desiredNumberScheduled"]).unwrap_or(0);
            let ready = int_at(obj, &["status", "numberReady"]).unwrap_or(0);
            replica_state(desired, ready)
        }
        "Service" => match str_at(obj, &["spec", "type"]) {
            Some("LoadBalancer") => load_balancer_state(obj),
            _ => State::Ready,
        },
        "Ingress" => load_balancer_state(obj),
        "PersistentVolumeClaim" => match str_at(obj, &["status", "phase"]) {
            Some("Bound") => State::Ready,
            _ => State::Unavailable,
        },
        "Pod" => pod_state(obj),
        _ => State::Ready,
    }
}
