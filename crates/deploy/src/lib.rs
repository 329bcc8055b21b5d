//! Deploy reconciliation: converge a manifest-described workload with what
//! the cluster is running.
//!
//! The flow is read-then-write per object. The remote read decides between
//! create and patch; a patch keeps the live replica count so a redeploy never
//! undoes scaling that happened since the manifest was written. The
//! deployment goes first, then the service. There is no rollback: whatever
//! was written stays written, and failures on one object do not stop the
//! next.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use metrics::{counter, histogram};
use skiff_cluster::ClusterGateway;
use skiff_core::Printer;
use skiff_manifest::template::{render_to_scratch, RenderContext, DEFAULT_TEMPLATE_REPLICAS};
use skiff_manifest::{ManifestError, ManifestSet};
use tracing::info;

const REVISION_HISTORY_LIMIT: i32 = 5;
const DEFAULT_REPLICAS: i32 = 1;

/// One deploy target: a named workload in a namespace, reached through a
/// gateway, reporting through a printer.
pub struct Deployer {
    namespace: String,
    name: String,
    gateway: Arc<dyn ClusterGateway>,
    out: Arc<dyn Printer>,
}

impl Deployer {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        gateway: Arc<dyn ClusterGateway>,
        out: Arc<dyn Printer>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            gateway,
            out,
        }
    }

    /// Reconcile the manifest at `path`, pointing the workload at `tag`.
    ///
    /// An unreadable manifest fails the call. Everything after that point is
    /// reported through the printer and does not fail it: a bad document mix
    /// or a cluster fault on one object still lets the other proceed.
    pub async fn apply(&self, path: &Path, tag: &str) -> Result<()> {
        let started = Instant::now();
        counter!("deploy_attempts", 1u64);
        let file = display_name(path);
        let set = ManifestSet::load_path(path).with_context(|| format!("loading {file}"))?;
        self.apply_deployment(&set, &file, tag).await;
        self.apply_service(&set, &file).await;
        histogram!("deploy_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    async fn apply_deployment(&self, set: &ManifestSet, file: &str, tag: &str) {
        let desired = match set.deployment() {
            Ok(found) => found.clone(),
            Err(ManifestError::MultipleDeployments) => {
                counter!("deploy_err", 1u64);
                self.out
                    .error(&format!("Only one deployment is currently allowed in {file}"));
                return;
            }
            Err(_) => {
                counter!("deploy_err", 1u64);
                self.out
                    .error(&format!("No deployment definition found in {file}"));
                return;
            }
        };
        let mut desired = fill_deployment(desired, &self.name, tag);
        match self.gateway.get_deployment(&self.namespace, &self.name).await {
            Ok(Some(live)) => {
                set_replicas(&mut desired, preserved_replicas(&live, DEFAULT_REPLICAS));
                info!(ns = %self.namespace, name = %self.name, "patching existing deployment");
                match self
                    .gateway
                    .patch_deployment(&self.namespace, &self.name, &desired)
                    .await
                {
                    Ok(()) => self.deployed(),
                    Err(e) => self.failed(&e.to_string()),
                }
            }
            Ok(None) => {
                info!(ns = %self.namespace, name = %self.name, "creating new deployment");
                match self
                    .gateway
                    .create_deployment(&self.namespace, &desired)
                    .await
                {
                    Ok(()) => self.deployed(),
                    Err(e) => self.failed(&e.to_string()),
                }
            }
            Err(e) => self.failed(&e.to_string()),
        }
    }

    async fn apply_service(&self, set: &ManifestSet, file: &str) {
        let desired = match set.service() {
            Ok(found) => found.clone(),
            Err(ManifestError::MultipleServices) => {
                self.out
                    .error(&format!("Only one service is currently allowed in {file}"));
                return;
            }
            Err(_) => {
                self.out
                    .line(&format!("No service definition found in {file}. Skipping service."));
                return;
            }
        };
        let desired = fill_service(desired, &self.name);
        match self.gateway.get_service(&self.namespace, &self.name).await {
            Ok(Some(_)) => {
                match self
                    .gateway
                    .patch_service(&self.namespace, &self.name, &desired)
                    .await
                {
                    Ok(()) => self.out.line("Service updated."),
                    Err(e) => self.out.error(&e.to_string()),
                }
            }
            Ok(None) => {
                match self.gateway.create_service(&self.namespace, &desired).await {
                    Ok(()) => self.out.line("Service created."),
                    Err(e) => self.out.error(&e.to_string()),
                }
            }
            Err(e) => self.out.error(&e.to_string()),
        }
    }

    /// Render `template` against the deploy context and hand the scratch
    /// file to the gateway's apply. The replica hint is read from the live
    /// object first, so the rendered count matches what is running.
    pub async fn apply_rendered(&self, template: &Path, tag: &str) -> Result<()> {
        let started = Instant::now();
        counter!("deploy_attempts", 1u64);
        let replicas = match self.gateway.get_deployment(&self.namespace, &self.name).await {
            Ok(Some(live)) => preserved_replicas(&live, DEFAULT_TEMPLATE_REPLICAS),
            Ok(None) => DEFAULT_TEMPLATE_REPLICAS,
            Err(e) => {
                self.out.error(&e.to_string());
                DEFAULT_TEMPLATE_REPLICAS
            }
        };
        let context = RenderContext {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            image: tag.to_string(),
            replicas,
        };
        let scratch = render_to_scratch(template, &context)
            .with_context(|| format!("rendering {}", template.display()))?;
        info!(template = %template.display(), replicas, "applying rendered manifest");
        match self.gateway.apply_file(&self.namespace, &scratch).await {
            Ok(report) => {
                counter!("deploy_ok", 1u64);
                for line in report.lines().filter(|l| !l.trim().is_empty()) {
                    self.out.line(line);
                }
                self.out
                    .line("Deployment successful. It may need some time to propagate.");
            }
            Err(e) => {
                counter!("deploy_err", 1u64);
                self.out.error(&e.to_string());
            }
        }
        let _ = std::fs::remove_file(&scratch);
        histogram!("deploy_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    /// Print the live picture of the configured deployment.
    ///
    /// Absence is part of the picture and only prints an error line;
    /// a failing read is a real error and propagates.
    pub async fn info(&self) -> Result<()> {
        match self.gateway.get_deployment(&self.namespace, &self.name).await {
            Ok(Some(live)) => {
                self.print_deployment_info(&format!("Current {}", self.name), &live);
                Ok(())
            }
            Ok(None) => {
                self.out.error(&format!(
                    "Deployment {} not found in namespace {}",
                    self.name, self.namespace
                ));
                Ok(())
            }
            Err(e) => Err(e).context("reading deployment"),
        }
    }

    fn print_deployment_info(&self, title: &str, deployment: &Deployment) {
        let Some(spec) = deployment.spec.as_ref() else {
            self.out.line(&format!("{} is not deployed.", self.name));
            return;
        };
        self.out.line(&format!("{title}:"));
        let containers = spec
            .template
            .spec
            .as_ref()
            .map(|pod| pod.containers.as_slice())
            .unwrap_or_default();
        for container in containers {
            self.out.line_at(
                &format!("image: {}", container.image.as_deref().unwrap_or("<none>")),
                4,
            );
            match deployment.status.as_ref() {
                Some(status) => self.out.line_at(
                    &format!(
                        "replicas: {}/{}",
                        status.ready_replicas.unwrap_or(0),
                        status.replicas.unwrap_or(0)
                    ),
                    4,
                ),
                None => self.out.line_at("replicas: no deployment", 4),
            }
        }
    }

    fn deployed(&self) {
        counter!("deploy_ok", 1u64);
        self.out
            .line("Deployment successful. It may need some time to propagate.");
    }

    fn failed(&self, msg: &str) {
        counter!("deploy_err", 1u64);
        self.out.error(msg);
    }
}

/// Fields the configuration owns, written over whatever the manifest says:
/// the object name, a matching `name` label on the pod template, a bounded
/// rollout history, and the image of the first container. Workloads with
/// more than one container get only their first container retagged.
pub fn fill_deployment(mut deployment: Deployment, name: &str, tag: &str) -> Deployment {
    deployment.metadata.name = Some(name.to_string());
    let spec = deployment.spec.get_or_insert_with(Default::default);
    spec.revision_history_limit = Some(REVISION_HISTORY_LIMIT);
    let meta = spec.template.metadata.get_or_insert_with(Default::default);
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .insert("name".to_string(), name.to_string());
    if let Some(pod) = spec.template.spec.as_mut() {
        if let Some(first) = pod.containers.first_mut() {
            first.image = Some(tag.to_string());
        }
    }
    deployment
}

/// The service is renamed to the target and its selector pinned to the
/// `name` label the deployment's pods carry.
pub fn fill_service(mut service: Service, name: &str) -> Service {
    service.metadata.name = Some(name.to_string());
    let spec = service.spec.get_or_insert_with(Default::default);
    spec.selector
        .get_or_insert_with(BTreeMap::new)
        .insert("name".to_string(), name.to_string());
    service
}

/// Replica count to carry across a redeploy: the reported status wins, the
/// declared spec is the fallback, `default` covers an object with neither.
pub fn preserved_replicas(live: &Deployment, default: i32) -> i32 {
    live.status
        .as_ref()
        .and_then(|status| status.replicas)
        .or_else(|| live.spec.as_ref().and_then(|spec| spec.replicas))
        .unwrap_or(default)
}

fn set_replicas(deployment: &mut Deployment, replicas: i32) {
    deployment.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
