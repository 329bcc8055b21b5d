//! Container image plumbing: local docker builds and pushes, plus the
//! registry-side existence probe that runs before any deploy.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use skiff_core::{tag_components, Printer, TagError};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("not authorized for registry {0}")]
    NotAuthorized(String),
    #[error("docker config {path}: {message}")]
    Config { path: String, message: String },
    #[error("credential helper {helper}: {message}")]
    Helper { helper: String, message: String },
    #[error("registry request: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected registry response: {0}")]
    Status(reqwest::StatusCode),
    #[error("docker exited with status {0}")]
    Docker(i32),
    #[error("docker not found on PATH")]
    DockerMissing,
    #[error(transparent)]
    Tag(#[from] TagError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Username and password for one registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
    #[serde(default, rename = "credsStore")]
    creds_store: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DockerAuthEntry {
    auth: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelperCredentials {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

fn docker_exe() -> String {
    std::env::var("SKIFF_DOCKER")
        .ok()
        .unwrap_or_else(|| "docker".to_string())
}

fn docker_config_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".docker")
        .join("config.json")
}

/// Credentials for `domain`, the way a logged-in docker resolves them: the
/// `auths` entry of the local config, routed through the configured
/// credential helper when one is set.
pub async fn registry_credentials(domain: &str) -> Result<RegistryAuth, RegistryError> {
    credentials_from_config(&docker_config_path(), domain).await
}

async fn credentials_from_config(
    path: &Path,
    domain: &str,
) -> Result<RegistryAuth, RegistryError> {
    let config_err = |message: String| RegistryError::Config {
        path: path.display().to_string(),
        message,
    };
    let text = std::fs::read_to_string(path).map_err(|e| config_err(e.to_string()))?;
    let config: DockerConfig =
        serde_json::from_str(&text).map_err(|e| config_err(e.to_string()))?;
    let entry = config
        .auths
        .get(domain)
        .ok_or_else(|| RegistryError::NotAuthorized(domain.to_string()))?;
    if let Some(store) = config.creds_store.as_deref() {
        return helper_credentials(store, domain).await;
    }
    let encoded = entry
        .auth
        .as_deref()
        .ok_or_else(|| RegistryError::NotAuthorized(domain.to_string()))?;
    let decoded = STANDARD
        .decode(encoded)
        .map_err(|e| config_err(format!("bad auth entry for {domain}: {e}")))?;
    let decoded = String::from_utf8_lossy(&decoded);
    let (username, password) = decoded
        .trim_end()
        .split_once(':')
        .ok_or_else(|| config_err(format!("auth entry for {domain} is not username:password")))?;
    Ok(RegistryAuth {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// Ask `docker-credential-<store>` for the domain's credentials, speaking
/// the helper protocol: domain on stdin, JSON on stdout.
async fn helper_credentials(store: &str, domain: &str) -> Result<RegistryAuth, RegistryError> {
    use tokio::io::AsyncWriteExt;

    let helper = format!("docker-credential-{store}");
    let helper_err = |message: String| RegistryError::Helper {
        helper: helper.clone(),
        message,
    };
    let mut child = tokio::process::Command::new(&helper)
        .arg("get")
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| helper_err(e.to_string()))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(domain.as_bytes())
            .await
            .map_err(|e| helper_err(e.to_string()))?;
    }
    let out = child
        .wait_with_output()
        .await
        .map_err(|e| helper_err(e.to_string()))?;
    if !out.status.success() {
        return Err(helper_err(
            String::from_utf8_lossy(&out.stderr).trim().to_string(),
        ));
    }
    let creds: HelperCredentials =
        serde_json::from_slice(&out.stdout).map_err(|e| helper_err(e.to_string()))?;
    Ok(RegistryAuth {
        username: creds.username,
        password: creds.secret,
    })
}

/// Probe the v2 API for the manifest behind `tag`. A 404 is a definite
/// absence; anything else unexpected is an error.
pub async fn image_exists(tag: &str) -> Result<bool, RegistryError> {
    let parts = tag_components(tag)?;
    let auth = registry_credentials(&parts.domain).await?;
    let url = format!(
        "https://{}/v2/{}/manifests/{}",
        parts.domain, parts.repository, parts.version
    );
    debug!(%url, "registry manifest probe");
    let response = reqwest::Client::new()
        .get(&url)
        .basic_auth(&auth.username, Some(&auth.password))
        .header(
            reqwest::header::ACCEPT,
            "application/vnd.docker.distribution.manifest.v2+json",
        )
        .send()
        .await?;
    let status = response.status();
    if status.is_success() {
        return Ok(true);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Ok(false);
    }
    Err(RegistryError::Status(status))
}

/// Build the working directory's docker context into `tag`. Docker's own
/// output goes straight to the terminal.
pub async fn build_image(tag: &str, out: &dyn Printer) -> Result<(), RegistryError> {
    out.line(&format!("Building image: {tag}"));
    run_docker(&["build", "-t", tag, "."]).await
}

/// Push a previously built `tag`.
pub async fn push_image(tag: &str, out: &dyn Printer) -> Result<(), RegistryError> {
    out.line(&format!("Pushing image: {tag}"));
    run_docker(&["push", tag]).await
}

async fn run_docker(args: &[&str]) -> Result<(), RegistryError> {
    let exe = docker_exe();
    debug!(%exe, ?args, "docker call");
    let status = tokio::process::Command::new(&exe)
        .args(args)
        .status()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RegistryError::DockerMissing,
            _ => RegistryError::Io(e),
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(RegistryError::Docker(status.code().unwrap_or(-1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{content}").unwrap();
        file
    }

    #[tokio::test]
    async fn auth_entry_decodes_to_username_and_password() {
        // base64 of "tim:secret"
        let file = write_config(
            r#"{"auths": {"a.registry.com": {"auth": "dGltOnNlY3JldA=="}}}"#,
        );
        let auth = credentials_from_config(file.path(), "a.registry.com")
            .await
            .unwrap();
        assert_eq!(
            auth,
            RegistryAuth {
                username: "tim".to_string(),
                password: "secret".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn unknown_domain_is_not_authorized() {
        let file = write_config(r#"{"auths": {"a.registry.com": {"auth": "eDp5"}}}"#);
        let err = credentials_from_config(file.path(), "other.registry.com")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotAuthorized(domain) if domain == "other.registry.com"));
    }

    #[tokio::test]
    async fn auth_entry_without_colon_is_rejected() {
        // base64 of "no-separator"
        let file = write_config(
            r#"{"auths": {"a.registry.com": {"auth": "bm8tc2VwYXJhdG9y"}}}"#,
        );
        let err = credentials_from_config(file.path(), "a.registry.com")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not username:password"), "{err}");
    }

    #[tokio::test]
    async fn creds_store_routes_through_the_helper() {
        let file = write_config(
            r#"{"auths": {"a.registry.com": {}}, "credsStore": "skiff-test-absent"}"#,
        );
        let err = credentials_from_config(file.path(), "a.registry.com")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Helper { helper, .. } if helper == "docker-credential-skiff-test-absent"
        ));
    }

    #[tokio::test]
    async fn unreadable_config_is_a_config_error() {
        let err = credentials_from_config(Path::new("/nonexistent/config.json"), "a.registry.com")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Config { .. }));
    }

    #[test]
    fn malformed_tag_fails_before_any_network_io() {
        let err = tag_components("no-separators").unwrap_err();
        assert!(RegistryError::from(err).to_string().contains("malformed image tag"));
    }
}
