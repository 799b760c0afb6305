//! Rudder manifest decoding.
//!
//! A desired-state entry is a base64 blob holding one or more YAML documents.
//! Decoding turns it into typed [`ManifestObject`]s, and [`filter_internal`]
//! drops the control objects that belong to the agent's own bookkeeping so they
//! never reach the cluster.

#![forbid(unsafe_code)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rudder_core::{EncodedManifest, Gvk, ObjectRef, RudderError};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

const DEFAULT_MAX_MANIFEST_BYTES: usize = 1024 * 1024;

fn max_manifest_bytes() -> usize {
    std::env::var("RUDDER_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(DEFAULT_MAX_MANIFEST_BYTES)
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("manifest payload too large (>{max} bytes)")]
    TooLarge { max: usize },
    #[error("document {index}: parsing YAML: {source}")]
    Yaml { index: usize, source: serde_yaml::Error },
    #[error("document {index}: {reason}")]
    Invalid { index: usize, reason: String },
    #[error("encoding YAML: {0}")]
    Encode(serde_yaml::Error),
}

impl From<DecodeError> for RudderError {
    fn from(e: DecodeError) -> Self { RudderError::Decode(e.to_string()) }
}

/// One declarative object out of a multi-document manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestObject {
    pub gvk: Gvk,
    pub name: String,
    pub namespace: Option<String>,
    pub body: Json,
}

impl ManifestObject {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef { gvk: self.gvk.clone(), name: self.name.clone(), namespace: self.namespace.clone() }
    }
}

/// Objects that survived the internal-GVK filter, ready for the applier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deployable {
    pub objects: Vec<ManifestObject>,
    /// Number of internal objects removed by the filter.
    pub filtered: usize,
}

impl Deployable {
    pub fn is_empty(&self) -> bool { self.objects.is_empty() }

    pub fn object_refs(&self) -> Vec<ObjectRef> { self.objects.iter().map(ManifestObject::object_ref).collect() }

    /// Render the kept objects back into a `---` separated YAML stream.
    pub fn to_yaml(&self) -> Result<Vec<u8>, DecodeError> {
        let mut out = String::new();
        for obj in &self.objects {
            out.push_str("---\n");
            out.push_str(&serde_yaml::to_string(&obj.body).map_err(DecodeError::Encode)?);
        }
        Ok(out.into_bytes())
    }
}

/// Decode a base64 entry into raw bytes. Line breaks inside the payload are ignored.
pub fn decode(entry: &EncodedManifest) -> Result<Vec<u8>, DecodeError> {
    decode_with_limit(entry, max_manifest_bytes())
}

/// [`decode`] with an explicit byte budget; payloads larger than `max` are rejected.
pub fn decode_with_limit(entry: &EncodedManifest, max: usize) -> Result<Vec<u8>, DecodeError> {
    let compact: String = entry.as_str().chars().filter(|c| !c.is_ascii_whitespace()).collect();
    // Reject before allocating when the padded length already proves the payload too big.
    let padding = compact.bytes().rev().take_while(|b| *b == b'=').count();
    if (compact.len() / 4 * 3).saturating_sub(padding) > max {
        return Err(DecodeError::TooLarge { max });
    }
    let bytes = STANDARD.decode(compact.as_bytes())?;
    if bytes.len() > max {
        return Err(DecodeError::TooLarge { max });
    }
    Ok(bytes)
}

/// Parse a multi-document YAML stream. Empty documents are skipped; every other
/// document must carry `apiVersion`, `kind` and `metadata.name`.
pub fn split_documents(bytes: &[u8]) -> Result<Vec<ManifestObject>, DecodeError> {
    let mut out = Vec::new();
    for (index, doc) in serde_yaml::Deserializer::from_slice(bytes).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).map_err(|source| DecodeError::Yaml { index, source })?;
        if val.is_null() {
            continue;
        }
        let body = serde_json::to_value(val)
            .map_err(|e| DecodeError::Invalid { index, reason: format!("converting YAML to JSON: {}", e) })?;
        out.push(parse_object(index, body)?);
    }
    Ok(out)
}

fn parse_object(index: usize, body: Json) -> Result<ManifestObject, DecodeError> {
    let invalid = |reason: &str| DecodeError::Invalid { index, reason: reason.to_string() };
    if !body.is_object() {
        return Err(invalid("document is not a mapping"));
    }
    let api_version = body.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| invalid("missing apiVersion"))?;
    let kind = body.get("kind").and_then(|v| v.as_str()).ok_or_else(|| invalid("missing kind"))?;
    let meta = body.get("metadata");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("missing metadata.name"))?
        .to_string();
    let namespace = meta
        .and_then(|m| m.get("namespace"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    let gvk = Gvk::from_api_version(api_version, kind);
    Ok(ManifestObject { gvk, name, namespace, body })
}

struct ReservedGvk {
    group: &'static str,
    version: &'static str,
    /// `None` reserves every kind of the group/version.
    kind: Option<&'static str>,
}

const INTERNAL_GVKS: &[ReservedGvk] = &[
    ReservedGvk { group: "kots.io", version: "v1beta1", kind: None },
    ReservedGvk { group: "troubleshoot.replicated.com", version: "v1beta1", kind: None },
    ReservedGvk { group: "troubleshoot.sh", version: "v1beta2", kind: None },
    ReservedGvk { group: "app.k8s.io", version: "v1beta1", kind: Some("Application") },
];

/// True when the GVK belongs to the agent's own bookkeeping objects.
pub fn is_internal(gvk: &Gvk) -> bool {
    INTERNAL_GVKS.iter().any(|r| {
        r.group == gvk.group && r.version == gvk.version && r.kind.map_or(true, |k| k == gvk.kind)
    })
}

pub fn filter_internal(objects: Vec<ManifestObject>) -> Deployable {
    let total = objects.len();
    let objects: Vec<ManifestObject> = objects
        .into_iter()
        .filter(|o| {
            let internal = is_internal(&o.gvk);
            if internal {
                debug!(gvk = %o.gvk, name = %o.name, "dropping internal object");
            }
            !internal
        })
        .collect();
    let filtered = total - objects.len();
    Deployable { objects, filtered }
}

/// Decode, split and filter one desired-state entry.
pub fn prepare(entry: &EncodedManifest) -> Result<Deployable, DecodeError> {
    let bytes = decode(entry)?;
    let objects = split_documents(&bytes)?;
    Ok(filter_internal(objects))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(s: &str) -> EncodedManifest { EncodedManifest(STANDARD.encode(s)) }

    const DEPLOYMENT: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  namespace: prod\nspec:\n  replicas: 2\n";

    #[test]
    fn prepares_single_deployment() {
        let d = prepare(&encode(DEPLOYMENT)).unwrap();
        assert_eq!(d.objects.len(), 1);
        assert_eq!(d.filtered, 0);
        let o = &d.objects[0];
        assert_eq!(o.gvk, Gvk::from_api_version("apps/v1", "Deployment"));
        assert_eq!(o.name, "web");
        assert_eq!(o.namespace.as_deref(), Some("prod"));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(prepare(&EncodedManifest::from("%%%not-base64")), Err(DecodeError::Base64(_))));
        // valid base64, but a bare scalar instead of an object
        assert!(matches!(prepare(&encode("garbage")), Err(DecodeError::Invalid { index: 0, .. })));
        assert!(matches!(prepare(&encode("kind: [unclosed")), Err(DecodeError::Yaml { .. })));
    }

    #[test]
    fn budget_admits_exactly_max_bytes() {
        // 998, 999 and 1000 bytes encode with one, zero and two padding characters.
        for n in [998usize, 999, 1000] {
            let entry = EncodedManifest(STANDARD.encode(vec![b'a'; n]));
            assert_eq!(decode_with_limit(&entry, n).map(|b| b.len()).ok(), Some(n), "n={}", n);
        }
    }

    #[test]
    fn budget_rejects_one_byte_over() {
        for n in [998usize, 999, 1000] {
            let entry = EncodedManifest(STANDARD.encode(vec![b'a'; n + 1]));
            assert!(matches!(decode_with_limit(&entry, n), Err(DecodeError::TooLarge { max }) if max == n), "n={}", n);
        }
        let err = decode_with_limit(&EncodedManifest(STANDARD.encode([0u8; 16])), 8).unwrap_err();
        assert_eq!(err.to_string(), "manifest payload too large (>8 bytes)");
    }

    #[test]
    fn default_budget_admits_a_full_mebibyte() {
        let entry = EncodedManifest(STANDARD.encode(vec![b'a'; DEFAULT_MAX_MANIFEST_BYTES]));
        assert_eq!(decode_with_limit(&entry, DEFAULT_MAX_MANIFEST_BYTES).map(|b| b.len()).ok(), Some(DEFAULT_MAX_MANIFEST_BYTES));
    }

    #[test]
    fn wrapped_base64_is_accepted() {
        let raw = STANDARD.encode(DEPLOYMENT);
        let (a, b) = raw.split_at(20);
        let d = prepare(&EncodedManifest(format!("{}\n{}\n", a, b))).unwrap();
        assert_eq!(d.objects.len(), 1);
    }

    #[test]
    fn missing_fields_are_friendly() {
        let e1 = split_documents(b"kind: Foo\nmetadata:\n  name: x\n").unwrap_err().to_string();
        assert!(e1.contains("missing apiVersion"), "e1={}", e1);
        let e2 = split_documents(b"apiVersion: v1\nmetadata:\n  name: x\n").unwrap_err().to_string();
        assert!(e2.contains("missing kind"), "e2={}", e2);
        let e3 = split_documents(b"apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n").unwrap_err().to_string();
        assert!(e3.contains("missing metadata.name"), "e3={}", e3);
    }

    #[test]
    fn splits_multi_document_and_skips_empty() {
        let yaml = format!("---\n{}---\n# just a comment\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: web\n", DEPLOYMENT);
        let objs = split_documents(yaml.as_bytes()).unwrap();
        let kinds: Vec<_> = objs.iter().map(|o| o.gvk.kind.as_str()).collect();
        assert_eq!(kinds, vec!["Deployment", "Service"]);
        assert_eq!(objs[1].namespace, None);
    }

    #[test]
    fn internal_objects_are_removed() {
        let yaml = format!(
            "apiVersion: kots.io/v1beta1\nkind: Config\nmetadata:\n  name: cfg\n---\n{}---\napiVersion: troubleshoot.replicated.com/v1beta1\nkind: Preflight\nmetadata:\n  name: pf\n---\napiVersion: app.k8s.io/v1beta1\nkind: Application\nmetadata:\n  name: app\n",
            DEPLOYMENT
        );
        let d = prepare(&encode(&yaml)).unwrap();
        assert_eq!(d.filtered, 3);
        assert_eq!(d.objects.len(), 1);
        assert!(d.objects.iter().all(|o| !is_internal(&o.gvk)));
    }

    #[test]
    fn reserved_set_is_version_sensitive() {
        assert!(is_internal(&Gvk::from_api_version("kots.io/v1beta1", "Anything")));
        assert!(is_internal(&Gvk::from_api_version("troubleshoot.sh/v1beta2", "SupportBundle")));
        assert!(!is_internal(&Gvk::from_api_version("kots.io/v2", "Config")));
        assert!(!is_internal(&Gvk::from_api_version("app.k8s.io/v1beta1", "Other")));
        assert!(!is_internal(&Gvk::from_api_version("apps/v1", "Deployment")));
    }

    #[test]
    fn only_internal_yields_empty_deployable() {
        let d = prepare(&encode("apiVersion: kots.io/v1beta1\nkind: License\nmetadata:\n  name: l\n")).unwrap();
        assert!(d.is_empty());
        assert_eq!(d.filtered, 1);
    }

    #[test]
    fn to_yaml_round_trips_through_split() {
        let d = prepare(&encode(DEPLOYMENT)).unwrap();
        let bytes = d.to_yaml().unwrap();
        let again = split_documents(&bytes).unwrap();
        assert_eq!(again, d.objects);
    }
}
