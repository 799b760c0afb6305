//! Rudder core types: desired state, resource states and the status aggregator.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque base64 payload holding one or more YAML documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodedManifest(pub String);

impl EncodedManifest {
    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<&str> for EncodedManifest {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for EncodedManifest {
    fn from(s: String) -> Self { Self(s) }
}

/// Target configuration fetched from the control plane once per tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub present: Vec<EncodedManifest>,
    #[serde(default)]
    pub missing: Vec<EncodedManifest>,
}

/// Observed condition of one managed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Ready,
    Degraded,
    Unavailable,
    Missing,
}

impl State {
    fn severity(self) -> u8 {
        match self {
            State::Ready => 0,
            State::Degraded => 1,
            State::Unavailable => 2,
            State::Missing => 3,
        }
    }

    /// The more severe of two states.
    pub fn worst(self, other: State) -> State {
        if other.severity() > self.severity() { other } else { self }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Ready => "ready",
            State::Degraded => "degraded",
            State::Unavailable => "unavailable",
            State::Missing => "missing",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Group/version/kind of a declarative object. Core group is the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    /// Split an `apiVersion` string (`v1`, `apps/v1`) and pair it with `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        Self { group, version, kind: kind.to_string() }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// Identity of a resource within one status snapshot.
///
/// Field order matters: the derived `Ord` sorts by `(kind, name, namespace)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl ResourceId {
    pub fn new(kind: impl Into<String>, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { kind: kind.into(), name: name.into(), namespace: namespace.into() }
    }
}

/// A managed object as addressed in the cluster. `namespace` is `None` when the
/// manifest leaves it to the backend default (or the kind is cluster-scoped).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub gvk: Gvk,
    pub name: String,
    pub namespace: Option<String>,
}

impl ObjectRef {
    pub fn resource_id(&self) -> ResourceId {
        ResourceId::new(&self.gvk.kind, &self.name, self.namespace.clone().unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub state: State,
}

/// One `(identity, state)` pair gathered during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub id: ResourceId,
    pub state: State,
}

impl Observation {
    pub fn new(id: ResourceId, state: State) -> Self { Self { id, state } }
}

/// Snapshot reported to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppStatus {
    pub app_id: String,
    pub resource_states: Vec<ResourceState>,
    pub updated_at: DateTime<Utc>,
}

impl AppStatus {
    /// Most severe state across all resources; `None` for an empty snapshot.
    pub fn overall(&self) -> Option<State> {
        self.resource_states.iter().map(|r| r.state).reduce(State::worst)
    }
}

/// Build a deterministic snapshot: dedup by identity (last observation wins),
/// sort ascending by `(kind, name, namespace)`.
pub fn aggregate<I>(app_id: &str, observations: I, now: DateTime<Utc>) -> AppStatus
where
    I: IntoIterator<Item = Observation>,
{
    let mut by_id: BTreeMap<ResourceId, State> = BTreeMap::new();
    for obs in observations {
        by_id.insert(obs.id, obs.state);
    }
    let resource_states = by_id
        .into_iter()
        .map(|(id, state)| ResourceState { kind: id.kind, name: id.name, namespace: id.namespace, state })
        .collect();
    AppStatus { app_id: app_id.to_string(), resource_states, updated_at: now }
}

/// Error taxonomy shared by every component of the agent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RudderError {
    #[error("network: {0}")]
    Network(String),
    #[error("unexpected status code from control plane: {code}")]
    Status { code: u16 },
    #[error("decode: {0}")]
    Decode(String),
    #[error("dry run failed: {0}")]
    DryRun(String),
    #[error("apply failed: {0}")]
    Apply(String),
    #[error("remove failed: {0}")]
    Remove(String),
    #[error("report failed: {0}")]
    Report(String),
}

impl RudderError {
    /// Short stable label for metrics and structured logs.
    pub fn label(&self) -> &'static str {
        match self {
            RudderError::Network(_) => "network",
            RudderError::Status { .. } => "status",
            RudderError::Decode(_) => "decode",
            RudderError::DryRun(_) => "dry_run",
            RudderError::Apply(_) => "apply",
            RudderError::Remove(_) => "remove",
            RudderError::Report(_) => "report",
        }
    }
}

pub type RudderResult<T> = Result<T, RudderError>;

pub mod prelude {
    pub use super::{
        aggregate, AppStatus, DesiredState, EncodedManifest, Gvk, ObjectRef, Observation, ResourceId,
        ResourceState, RudderError, RudderResult, State,
    };
}
