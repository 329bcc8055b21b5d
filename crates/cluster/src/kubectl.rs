//! kubectl transport: the same gateway surface, shelled out.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use serde_json::Value as Json;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{selector_string, ClusterError, ClusterGateway};

const TOOL: &str = "kubectl";

/// Gateway that drives the kubectl binary. `SKIFF_KUBECTL` overrides the
/// executable, which the tests use to substitute a script.
pub struct KubectlGateway {
    exe: String,
}

impl KubectlGateway {
    pub fn new() -> Self {
        let exe = std::env::var("SKIFF_KUBECTL")
            .ok()
            .unwrap_or_else(|| TOOL.to_string());
        Self { exe }
    }

    /// Full argument list for one invocation: the namespace flag comes
    /// before the verb, reads always ask for JSON.
    fn command_args(namespace: &str, args: &[&str]) -> Vec<String> {
        let mut cmd = Vec::with_capacity(args.len() + 2);
        if !namespace.is_empty() {
            cmd.push("--namespace".to_string());
            cmd.push(namespace.to_string());
        }
        cmd.extend(args.iter().map(|s| s.to_string()));
        cmd
    }

    async fn call(&self, args: &[String]) -> Result<String, ClusterError> {
        debug!(exe = %self.exe, ?args, "kubectl call");
        let out = tokio::process::Command::new(&self.exe)
            .args(args)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ClusterError::ToolMissing(TOOL),
                _ => ClusterError::Io(e),
            })?;
        if !out.status.success() {
            return Err(ClusterError::CommandFailed {
                tool: TOOL,
                status: out.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    async fn call_with_stdin(&self, args: &[String], input: &[u8]) -> Result<String, ClusterError> {
        debug!(exe = %self.exe, ?args, "kubectl call with stdin");
        let mut child = tokio::process::Command::new(&self.exe)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ClusterError::ToolMissing(TOOL),
                _ => ClusterError::Io(e),
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).await?;
        }
        let out = child.wait_with_output().await?;
        if !out.status.success() {
            return Err(ClusterError::CommandFailed {
                tool: TOOL,
                status: out.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    /// Read one object as JSON; a NotFound complaint on stderr is an absence,
    /// not a failure.
    async fn get_json(
        &self,
        namespace: &str,
        resource: &str,
        name: &str,
    ) -> Result<Option<Json>, ClusterError> {
        let args = Self::command_args(namespace, &["get", resource, name, "-o", "json"]);
        match self.call(&args).await {
            Ok(text) => Ok(Some(
                serde_json::from_str(&text).map_err(|e| ClusterError::Decode(e.to_string()))?,
            )),
            Err(ClusterError::CommandFailed { stderr, .. }) if stderr.contains("NotFound") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_json(&self, namespace: &str, body: Json) -> Result<(), ClusterError> {
        let args = Self::command_args(namespace, &["create", "-f", "-"]);
        let payload =
            serde_json::to_vec(&body).map_err(|e| ClusterError::Decode(e.to_string()))?;
        self.call_with_stdin(&args, &payload).await?;
        Ok(())
    }

    async fn patch_json(
        &self,
        namespace: &str,
        resource: &str,
        name: &str,
        body: Json,
    ) -> Result<(), ClusterError> {
        let payload =
            serde_json::to_string(&body).map_err(|e| ClusterError::Decode(e.to_string()))?;
        let args = Self::command_args(
            namespace,
            &["patch", resource, name, "--type", "merge", "-p", &payload],
        );
        self.call(&args).await?;
        Ok(())
    }
}

impl Default for KubectlGateway {
    fn default() -> Self {
        Self::new()
    }
}

fn to_typed<T>(json: Json) -> Result<T, ClusterError>
where
    T: serde::de::DeserializeOwned + k8s_openapi::Resource,
{
    skiff_manifest::decode(json).map_err(|e| ClusterError::Decode(e.to_string()))
}

fn to_json<T: serde::Serialize>(body: &T) -> Result<Json, ClusterError> {
    serde_json::to_value(body).map_err(|e| ClusterError::Decode(e.to_string()))
}

#[async_trait]
impl ClusterGateway for KubectlGateway {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, ClusterError> {
        match self.get_json(namespace, "deployment", name).await? {
            Some(json) => Ok(Some(to_typed(json)?)),
            None => Ok(None),
        }
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        body: &Deployment,
    ) -> Result<(), ClusterError> {
        self.create_json(namespace, to_json(body)?).await
    }

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        body: &Deployment,
    ) -> Result<(), ClusterError> {
        self.patch_json(namespace, "deployment", name, to_json(body)?)
            .await
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, ClusterError> {
        match self.get_json(namespace, "service", name).await? {
            Some(json) => Ok(Some(to_typed(json)?)),
            None => Ok(None),
        }
    }

    async fn create_service(&self, namespace: &str, body: &Service) -> Result<(), ClusterError> {
        self.create_json(namespace, to_json(body)?).await
    }

    async fn patch_service(
        &self,
        namespace: &str,
        name: &str,
        body: &Service,
    ) -> Result<(), ClusterError> {
        self.patch_json(namespace, "service", name, to_json(body)?)
            .await
    }

    async fn apply_file(&self, namespace: &str, path: &Path) -> Result<String, ClusterError> {
        let file = path.display().to_string();
        let args = Self::command_args(namespace, &["apply", "-f", &file]);
        match self.call(&args).await {
            Ok(output) => Ok(output),
            Err(ClusterError::CommandFailed { stderr, .. }) => Err(ClusterError::Apply(stderr)),
            Err(e) => Err(e),
        }
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        selectors: &BTreeMap<String, String>,
    ) -> Result<Vec<Json>, ClusterError> {
        let selector = selector_string(selectors);
        let mut args = vec!["get", "deployments"];
        if !selector.is_empty() {
            args.push("--selector");
            args.push(&selector);
        }
        args.extend(["-o", "json"]);
        let text = self.call(&Self::command_args(namespace, &args)).await?;
        let listing: Json =
            serde_json::from_str(&text).map_err(|e| ClusterError::Decode(e.to_string()))?;
        match listing.get("items").and_then(Json::as_array) {
            Some(items) => Ok(items.clone()),
            None => Err(ClusterError::Decode(
                "listing without an items array".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_flag_precedes_the_verb() {
        let args = KubectlGateway::command_args("avengers", &["get", "deployment", "hulk", "-o", "json"]);
        assert_eq!(
            args,
            vec!["--namespace", "avengers", "get", "deployment", "hulk", "-o", "json"]
        );
    }

    #[test]
    fn empty_namespace_adds_no_flag() {
        let args = KubectlGateway::command_args("", &["apply", "-f", "x.yml"]);
        assert_eq!(args, vec!["apply", "-f", "x.yml"]);
    }

    #[test]
    fn typed_decode_tolerates_legacy_api_version() {
        let json = serde_json::json!({
            "apiVersion": "extensions/v1beta1",
            "kind": "Deployment",
            "metadata": {"name": "old"},
            "spec": {
                "selector": {"matchLabels": {"name": "old"}},
                "template": {"spec": {"containers": [{"name": "old"}]}}
            }
        });
        let deployment: Deployment = to_typed(json).unwrap();
        assert_eq!(deployment.metadata.name.as_deref(), Some("old"));
    }
}
