//! Manifest loading and classification for the deploy pipeline.
//!
//! A manifest file is a YAML stream (JSON works too). Every document is kept;
//! the kinds the deployer acts on are decoded into their typed form, the rest
//! ride along untyped so a future `kubectl apply` path can still see them.

#![forbid(unsafe_code)]

pub mod template;

use std::path::Path;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing manifest: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("manifest missing {0}")]
    MissingField(&'static str),
    #[error("bad {kind} definition: {source}")]
    Decode {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no deployment definition found")]
    NoDeployment,
    #[error("more than one deployment definition found")]
    MultipleDeployments,
    #[error("no service definition found")]
    NoService,
    #[error("more than one service definition found")]
    MultipleServices,
    #[error("rendering template: {0}")]
    Template(#[from] minijinja::Error),
}

/// One document out of a manifest stream.
#[derive(Debug, Clone)]
pub enum ManifestDocument {
    Deployment(Box<Deployment>),
    Service(Box<Service>),
    Other {
        api_version: String,
        kind: String,
        raw: Json,
    },
}

impl ManifestDocument {
    pub fn kind(&self) -> &str {
        match self {
            ManifestDocument::Deployment(_) => "Deployment",
            ManifestDocument::Service(_) => "Service",
            ManifestDocument::Other { kind, .. } => kind,
        }
    }
}

/// All documents of one manifest file, in file order.
#[derive(Debug, Clone, Default)]
pub struct ManifestSet {
    docs: Vec<ManifestDocument>,
}

impl ManifestSet {
    pub fn load_path(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path).map_err(|e| ManifestError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse_str(&text)
    }

    pub fn parse_str(text: &str) -> Result<Self, ManifestError> {
        let mut docs = Vec::new();
        for document in serde_yaml::Deserializer::from_str(text) {
            let value = serde_yaml::Value::deserialize(document)?;
            if let Some(doc) = parse_document(value)? {
                docs.push(doc);
            }
        }
        Ok(Self { docs })
    }

    pub fn docs(&self) -> &[ManifestDocument] {
        &self.docs
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// The single deployment of the set. More than one is an error rather
    /// than a silent pick.
    pub fn deployment(&self) -> Result<&Deployment, ManifestError> {
        let mut found = None;
        for doc in &self.docs {
            if let ManifestDocument::Deployment(d) = doc {
                if found.is_some() {
                    return Err(ManifestError::MultipleDeployments);
                }
                found = Some(d.as_ref());
            }
        }
        found.ok_or(ManifestError::NoDeployment)
    }

    /// The single service of the set, same uniqueness rule as deployments.
    pub fn service(&self) -> Result<&Service, ManifestError> {
        let mut found = None;
        for doc in &self.docs {
            if let ManifestDocument::Service(s) = doc {
                if found.is_some() {
                    return Err(ManifestError::MultipleServices);
                }
                found = Some(s.as_ref());
            }
        }
        found.ok_or(ManifestError::NoService)
    }
}

fn parse_document(value: serde_yaml::Value) -> Result<Option<ManifestDocument>, ManifestError> {
    if value.is_null() {
        return Ok(None);
    }
    let json = serde_json::to_value(value).map_err(|e| ManifestError::Decode {
        kind: "document".to_string(),
        source: e,
    })?;
    let api_version = json
        .get("apiVersion")
        .and_then(Json::as_str)
        .ok_or(ManifestError::MissingField("apiVersion"))?
        .to_string();
    let kind = json
        .get("kind")
        .and_then(Json::as_str)
        .ok_or(ManifestError::MissingField("kind"))?
        .to_string();
    let group = match api_version.split_once('/') {
        Some((group, _version)) => group,
        None => "",
    };
    match (group, kind.as_str()) {
        // Older manifests still say extensions/v1beta1 or apps/v1beta2; the
        // typed struct pins the served apiVersion on the way back out.
        ("apps", "Deployment") | ("extensions", "Deployment") => {
            Ok(Some(ManifestDocument::Deployment(Box::new(decode(json)?))))
        }
        ("", "Service") => Ok(Some(ManifestDocument::Service(Box::new(decode(json)?)))),
        _ => Ok(Some(ManifestDocument::Other {
            api_version,
            kind,
            raw: json,
        })),
    }
}

/// Decode an untyped document into its typed form. The type meta keys are
/// dropped first, the typed deserializer rejects versions it does not serve.
pub fn decode<T: DeserializeOwned + k8s_openapi::Resource>(
    mut json: Json,
) -> Result<T, ManifestError> {
    if let Some(obj) = json.as_object_mut() {
        obj.remove("apiVersion");
        obj.remove("kind");
    }
    serde_json::from_value(json).map_err(|e| ManifestError::Decode {
        kind: T::KIND.to_string(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOYMENT: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: the-service
spec:
  replicas: 2
  selector:
    matchLabels:
      name: the-service
  template:
    metadata:
      labels:
        name: the-service
    spec:
      containers:
      - name: the-service
        image: a.registry/the-service:0ld
        ports:
        - containerPort: 8000
"#;

    const SERVICE: &str = r#"
apiVersion: v1
kind: Service
metadata:
  name: the-service
spec:
  ports:
  - port: 80
    targetPort: 8000
  selector:
    name: the-service
"#;

    const CONFIG_MAP: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: extras
data:
  key: value
"#;

    #[test]
    fn parses_a_multi_document_stream() {
        let text = format!("{DEPLOYMENT}---{SERVICE}---{CONFIG_MAP}");
        let set = ManifestSet::parse_str(&text).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.docs()[0].kind(), "Deployment");
        assert_eq!(set.docs()[1].kind(), "Service");
        assert_eq!(set.docs()[2].kind(), "ConfigMap");
    }

    #[test]
    fn classification_ignores_document_order() {
        let text = format!("{CONFIG_MAP}---{SERVICE}---{DEPLOYMENT}");
        let set = ManifestSet::parse_str(&text).unwrap();
        assert_eq!(
            set.deployment().unwrap().metadata.name.as_deref(),
            Some("the-service")
        );
        assert_eq!(
            set.service().unwrap().metadata.name.as_deref(),
            Some("the-service")
        );
    }

    #[test]
    fn empty_documents_are_skipped() {
        let set = ManifestSet::parse_str("---\n---\n").unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn deployment_is_typed() {
        let set = ManifestSet::parse_str(DEPLOYMENT).unwrap();
        let deployment = set.deployment().unwrap();
        assert_eq!(deployment.metadata.name.as_deref(), Some("the-service"));
        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(2));
        let containers = &spec.template.spec.as_ref().unwrap().containers;
        assert_eq!(containers[0].image.as_deref(), Some("a.registry/the-service:0ld"));
    }

    #[test]
    fn legacy_api_groups_still_decode() {
        let legacy = DEPLOYMENT.replace("apps/v1", "extensions/v1beta1");
        let set = ManifestSet::parse_str(&legacy).unwrap();
        assert!(set.deployment().is_ok());
    }

    #[test]
    fn json_input_is_accepted() {
        let set = ManifestSet::parse_str(
            r#"{"apiVersion": "v1", "kind": "Service", "metadata": {"name": "s"}}"#,
        )
        .unwrap();
        assert_eq!(set.service().unwrap().metadata.name.as_deref(), Some("s"));
    }

    #[test]
    fn missing_type_meta_is_reported() {
        let err = ManifestSet::parse_str("metadata:\n  name: x\n").unwrap_err();
        assert!(err.to_string().contains("missing apiVersion"), "{err}");
    }

    #[test]
    fn missing_kind_is_reported() {
        let err = ManifestSet::parse_str("apiVersion: v1\nmetadata: {}\n").unwrap_err();
        assert!(err.to_string().contains("missing kind"), "{err}");
    }

    #[test]
    fn no_deployment_in_service_only_stream() {
        let set = ManifestSet::parse_str(SERVICE).unwrap();
        assert!(matches!(set.deployment(), Err(ManifestError::NoDeployment)));
    }

    #[test]
    fn two_deployments_are_an_error() {
        let text = format!("{DEPLOYMENT}---{DEPLOYMENT}");
        let set = ManifestSet::parse_str(&text).unwrap();
        assert!(matches!(
            set.deployment(),
            Err(ManifestError::MultipleDeployments)
        ));
    }

    #[test]
    fn two_services_are_an_error() {
        let text = format!("{SERVICE}---{SERVICE}");
        let set = ManifestSet::parse_str(&text).unwrap();
        assert!(matches!(set.service(), Err(ManifestError::MultipleServices)));
    }

    #[test]
    fn unsupported_kinds_stay_raw() {
        let set = ManifestSet::parse_str(CONFIG_MAP).unwrap();
        match &set.docs()[0] {
            ManifestDocument::Other { api_version, kind, raw } => {
                assert_eq!(api_version, "v1");
                assert_eq!(kind, "ConfigMap");
                assert_eq!(raw.pointer("/data/key").and_then(Json::as_str), Some("value"));
            }
            other => panic!("expected untyped document, got {}", other.kind()),
        }
    }

    #[test]
    fn load_path_reports_the_file_name() {
        let err = ManifestSet::load_path(Path::new("does-not-exist.yml")).unwrap_err();
        assert!(err.to_string().contains("does-not-exist.yml"), "{err}");
    }
}
