use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use skiff_cluster::{snapshot, ClusterGateway, KubeGateway};
use skiff_cluster::kubectl::KubectlGateway;
use skiff_core::{make_tag, Printer};
use skiff_deploy::Deployer;
use skiff_gitrev::GitError;

mod prompt;
use prompt::Prompt;

#[derive(Parser, Debug)]
#[command(name = "skiff", version, about = "Build, push, and deploy services to Kubernetes")]
struct Cli {
    /// Output format for listings
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve a version, check the image, and roll the workload out
    Deploy {
        /// Registry the image lives in
        #[arg(long, env = "SKIFF_REGISTRY")]
        registry: String,
        /// Image name within the registry
        #[arg(long, env = "SKIFF_IMAGE")]
        image: String,
        /// Deployment name; defaults to the image name
        #[arg(long)]
        name: Option<String>,
        #[arg(long, env = "SKIFF_NAMESPACE", default_value = "default")]
        namespace: String,
        /// The git branch to deploy
        #[arg(long, default_value = "master")]
        branch: String,
        /// Version to deploy; skips git resolution when given
        #[arg(long)]
        version: Option<String>,
        /// Manifest file to reconcile
        #[arg(long, default_value = "deployment.yml")]
        file: PathBuf,
        /// Render this template instead of loading --file
        #[arg(long)]
        template: Option<PathBuf>,
        /// Build and push the local state of the service first
        #[arg(long, action = ArgAction::SetTrue)]
        local: bool,
        /// Run without building, pushing, or deploying anything
        #[arg(long, action = ArgAction::SetTrue)]
        dry: bool,
    },
    /// Build a docker image tagged with the local git HEAD
    Build {
        #[arg(long, env = "SKIFF_REGISTRY")]
        registry: String,
        #[arg(long, env = "SKIFF_IMAGE")]
        image: String,
        /// Version to tag; defaults to the local HEAD
        #[arg(long)]
        version: Option<String>,
    },
    /// Push a previously built image
    Push {
        #[arg(long, env = "SKIFF_REGISTRY")]
        registry: String,
        #[arg(long, env = "SKIFF_IMAGE")]
        image: String,
        /// Version to push; defaults to the local HEAD
        #[arg(long)]
        version: Option<String>,
    },
    /// Show the live state of a deployment
    Info {
        #[arg(long)]
        name: String,
        #[arg(long, env = "SKIFF_NAMESPACE", default_value = "default")]
        namespace: String,
    },
    /// List deployments cluster-side, optionally dumping a reusable snapshot
    ClusterInfo {
        #[arg(long, env = "SKIFF_NAMESPACE", default_value = "default")]
        namespace: String,
        /// Only deployments labeled servicegroup=<value>
        #[arg(long)]
        servicegroup: Option<String>,
        /// Scrub the listing and write it as a YAML List to this file
        #[arg(long = "dump-to")]
        dump_to: Option<PathBuf>,
    },
}

fn init_tracing() {
    let env = std::env::var("SKIFF_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SKIFF_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SKIFF_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let out: Arc<dyn Printer> = Arc::new(Prompt::new());

    if let Err(e) = run(cli, out).await {
        error!(error = ?e, "command failed");
        eprintln!("skiff: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli, out: Arc<dyn Printer>) -> Result<()> {
    match cli.command {
        Commands::Deploy {
            registry,
            image,
            name,
            namespace,
            branch,
            version,
            file,
            template,
            local,
            dry,
        } => {
            let name = name.unwrap_or_else(|| image.clone());
            info!(%registry, %image, %name, %namespace, local, dry, "deploy invoked");
            let version = match version {
                Some(version) => version,
                // Local mode versions from the local HEAD, so the branch is
                // not consulted.
                None => {
                    let wanted = if local { None } else { Some(branch.as_str()) };
                    resolve_version(wanted, local, &out).await?
                }
            };
            let tag = make_tag(&registry, &image, &version);

            if local && !dry {
                skiff_registry::build_image(&tag, out.as_ref()).await?;
                skiff_registry::push_image(&tag, out.as_ref()).await?;
            }

            match skiff_registry::image_exists(&tag).await {
                Ok(true) => {}
                Ok(false) => {
                    out.error(&format!("Image not found: {tag}"));
                    if !dry {
                        std::process::exit(1);
                    }
                }
                Err(e) => return Err(e).context("registry probe"),
            }

            let gateway: Arc<dyn ClusterGateway> = Arc::new(KubeGateway::try_default().await?);
            let deployer = Deployer::new(namespace, name, gateway, out.clone());
            deployer.info().await?;

            if dry {
                out.line("Dry run finished. Not deploying.");
                return Ok(());
            }

            match template {
                Some(template) => deployer.apply_rendered(&template, &tag).await?,
                None => deployer.apply(&file, &tag).await?,
            }
        }
        Commands::Build { registry, image, version } => {
            let version = match version {
                Some(version) => version,
                None => resolve_version(None, true, &out).await?,
            };
            let tag = make_tag(&registry, &image, &version);
            skiff_registry::build_image(&tag, out.as_ref()).await?;
        }
        Commands::Push { registry, image, version } => {
            let version = match version {
                Some(version) => version,
                None => resolve_version(None, true, &out).await?,
            };
            let tag = make_tag(&registry, &image, &version);
            skiff_registry::push_image(&tag, out.as_ref()).await?;
        }
        Commands::Info { name, namespace } => {
            info!(%name, %namespace, "info invoked");
            let gateway = KubeGateway::try_default().await?;
            match cli.output {
                Output::Human => {
                    let gateway: Arc<dyn ClusterGateway> = Arc::new(gateway);
                    Deployer::new(namespace, name, gateway, out.clone()).info().await?;
                }
                Output::Json => {
                    let deployment = gateway.get_deployment(&namespace, &name).await?;
                    println!("{}", serde_json::to_string_pretty(&deployment)?);
                }
            }
        }
        Commands::ClusterInfo { namespace, servicegroup, dump_to } => {
            info!(%namespace, ?servicegroup, "cluster-info invoked");
            let gateway = KubectlGateway::new();
            let mut selectors = BTreeMap::new();
            if let Some(group) = servicegroup {
                selectors.insert("servicegroup".to_string(), group);
            }
            let mut items = gateway.list_deployments(&namespace, &selectors).await?;
            match dump_to {
                Some(path) => {
                    snapshot::refresh_replicas(&gateway, &mut items, out.as_ref()).await;
                    snapshot::scrub_items(&mut items);
                    let yaml = snapshot::dump_yaml(&items)?;
                    std::fs::write(&path, yaml)
                        .with_context(|| format!("writing {}", path.display()))?;
                    out.line(&format!("Cluster state written to {}", path.display()));
                }
                None => match cli.output {
                    Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
                    Output::Human => {
                        for item in &items {
                            print_cluster_item(out.as_ref(), item);
                        }
                    }
                },
            }
        }
    }
    Ok(())
}

/// Version for a tag, from git. User-answerable resolution failures print
/// and exit; anything else propagates.
async fn resolve_version(
    branch: Option<&str>,
    local: bool,
    out: &Arc<dyn Printer>,
) -> Result<String> {
    let cwd = std::env::current_dir()?;
    match skiff_gitrev::head_of(&cwd, branch, local, out.as_ref()).await {
        Ok(version) => Ok(version),
        Err(
            e @ (GitError::Inconclusive(_)
            | GitError::NoRemoteBranch(_)
            | GitError::AmbiguousRemotes(_)),
        ) => {
            out.error(&e.to_string());
            std::process::exit(1);
        }
        Err(e) => Err(e).context("resolving git HEAD"),
    }
}

fn print_cluster_item(out: &dyn Printer, item: &serde_json::Value) {
    let name = item
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .unwrap_or("<unnamed>");
    out.line(&format!("{name}:"));
    if let Some(containers) = item
        .pointer("/spec/template/spec/containers")
        .and_then(|v| v.as_array())
    {
        for container in containers {
            if let Some(image) = container.get("image").and_then(|v| v.as_str()) {
                out.line_at(&format!("image: {image}"), 4);
            }
        }
    }
    match item.get("status") {
        Some(status) => {
            let ready = status.get("readyReplicas").and_then(|v| v.as_i64()).unwrap_or(0);
            let total = status.get("replicas").and_then(|v| v.as_i64()).unwrap_or(0);
            out.line_at(&format!("replicas: {ready}/{total}"), 4);
        }
        None => out.line_at("replicas: no deployment", 4),
    }
}
