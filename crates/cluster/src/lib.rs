//! Cluster gateway: the one place skiff talks to Kubernetes.
//!
//! Two transports implement the same surface. [`KubeGateway`] goes through
//! the typed client and is what the deployer uses; [`kubectl::KubectlGateway`]
//! shells out and exists for the odd cluster where only the CLI is trusted.

#![forbid(unsafe_code)]

pub mod kubectl;
pub mod snapshot;

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::Value as Json;
use skiff_manifest::{ManifestDocument, ManifestSet};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("apply failed: {0}")]
    Apply(String),
    #[error("cluster api: {0}")]
    Api(#[source] kube::Error),
    #[error("{tool} exited with status {status}: {stderr}")]
    CommandFailed {
        tool: &'static str,
        status: i32,
        stderr: String,
    },
    #[error("{0} not found on PATH")]
    ToolMissing(&'static str),
    #[error("decoding cluster response: {0}")]
    Decode(String),
    #[error("unsupported kind {0} in rendered manifest")]
    UnsupportedKind(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        ClusterError::Api(e)
    }
}

/// Everything the rest of skiff is allowed to do to a cluster. Reads come
/// back three-way: the object, a definite absence, or a failure.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, ClusterError>;

    async fn create_deployment(
        &self,
        namespace: &str,
        body: &Deployment,
    ) -> Result<(), ClusterError>;

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        body: &Deployment,
    ) -> Result<(), ClusterError>;

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, ClusterError>;

    async fn create_service(&self, namespace: &str, body: &Service) -> Result<(), ClusterError>;

    async fn patch_service(
        &self,
        namespace: &str,
        name: &str,
        body: &Service,
    ) -> Result<(), ClusterError>;

    /// Apply a rendered manifest file as-is. Returns the transport's own
    /// report, one object per line.
    async fn apply_file(&self, namespace: &str, path: &Path) -> Result<String, ClusterError>;

    /// Deployments in the namespace matching all `selectors`, as raw objects.
    async fn list_deployments(
        &self,
        namespace: &str,
        selectors: &BTreeMap<String, String>,
    ) -> Result<Vec<Json>, ClusterError>;
}

/// Label selector in the `k1=v1,k2=v2` form both transports speak.
pub fn selector_string(selectors: &BTreeMap<String, String>) -> String {
    selectors
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Client from the ambient kubeconfig or in-cluster environment.
pub async fn get_kube_client() -> Result<Client, ClusterError> {
    Client::try_default().await.map_err(ClusterError::Api)
}

/// Gateway over the typed kube client.
pub struct KubeGateway {
    client: Client,
}

impl KubeGateway {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> Result<Self, ClusterError> {
        Ok(Self::new(get_kube_client().await?))
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, ClusterError> {
        debug!(ns = %namespace, name = %name, "get deployment");
        Ok(self.deployments(namespace).get_opt(name).await?)
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        body: &Deployment,
    ) -> Result<(), ClusterError> {
        info!(ns = %namespace, name = ?body.metadata.name, "create deployment");
        self.deployments(namespace)
            .create(&PostParams::default(), body)
            .await?;
        Ok(())
    }

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        body: &Deployment,
    ) -> Result<(), ClusterError> {
        info!(ns = %namespace, name = %name, "patch deployment");
        self.deployments(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(body))
            .await?;
        Ok(())
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, ClusterError> {
        debug!(ns = %namespace, name = %name, "get service");
        Ok(self.services(namespace).get_opt(name).await?)
    }

    async fn create_service(&self, namespace: &str, body: &Service) -> Result<(), ClusterError> {
        info!(ns = %namespace, name = ?body.metadata.name, "create service");
        self.services(namespace)
            .create(&PostParams::default(), body)
            .await?;
        Ok(())
    }

    async fn patch_service(
        &self,
        namespace: &str,
        name: &str,
        body: &Service,
    ) -> Result<(), ClusterError> {
        info!(ns = %namespace, name = %name, "patch service");
        self.services(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(body))
            .await?;
        Ok(())
    }

    async fn apply_file(&self, namespace: &str, path: &Path) -> Result<String, ClusterError> {
        let set = ManifestSet::load_path(path).map_err(|e| ClusterError::Apply(e.to_string()))?;
        let params = PatchParams::apply("skiff");
        let mut lines = Vec::new();
        for doc in set.docs() {
            match doc {
                ManifestDocument::Deployment(d) => {
                    let name = named(&d.metadata)?;
                    self.deployments(namespace)
                        .patch(&name, &params, &Patch::Apply(d.as_ref()))
                        .await
                        .map_err(|e| ClusterError::Apply(e.to_string()))?;
                    lines.push(format!("deployment.apps/{name} serverside-applied"));
                }
                ManifestDocument::Service(s) => {
                    let name = named(&s.metadata)?;
                    self.services(namespace)
                        .patch(&name, &params, &Patch::Apply(s.as_ref()))
                        .await
                        .map_err(|e| ClusterError::Apply(e.to_string()))?;
                    lines.push(format!("service/{name} serverside-applied"));
                }
                ManifestDocument::Other { kind, .. } => {
                    return Err(ClusterError::UnsupportedKind(kind.clone()));
                }
            }
        }
        Ok(lines.join("\n"))
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        selectors: &BTreeMap<String, String>,
    ) -> Result<Vec<Json>, ClusterError> {
        let mut params = ListParams::default();
        let selector = selector_string(selectors);
        if !selector.is_empty() {
            params = params.labels(&selector);
        }
        let list = self.deployments(namespace).list(&params).await?;
        list.items
            .into_iter()
            .map(|d| serde_json::to_value(d).map_err(|e| ClusterError::Decode(e.to_string())))
            .collect()
    }
}

fn named(metadata: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> Result<String, ClusterError> {
    metadata
        .name
        .clone()
        .ok_or_else(|| ClusterError::Apply("manifest object missing metadata.name".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_string_is_sorted_and_joined() {
        let mut selectors = BTreeMap::new();
        assert_eq!(selector_string(&selectors), "");
        selectors.insert("servicegroup".to_string(), "web".to_string());
        assert_eq!(selector_string(&selectors), "servicegroup=web");
        selectors.insert("app".to_string(), "api".to_string());
        assert_eq!(selector_string(&selectors), "app=api,servicegroup=web");
    }

    #[test]
    fn missing_name_is_an_apply_error() {
        let meta = k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta::default();
        let err = named(&meta).unwrap_err();
        assert!(err.to_string().contains("metadata.name"), "{err}");
    }
}
