//! Jinja-style manifest templates, rendered to a scratch file the cluster
//! transport can apply directly.

use std::path::{Path, PathBuf};

use minijinja::Environment;
use serde::Serialize;
use uuid::Uuid;

use crate::ManifestError;

/// Values a template can reference: `{{ name }}`, `{{ namespace }}`,
/// `{{ image }}`, `{{ replicas }}`.
#[derive(Debug, Clone, Serialize)]
pub struct RenderContext {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub replicas: i32,
}

/// Replica hint for a workload deployed for the first time via template.
pub const DEFAULT_TEMPLATE_REPLICAS: i32 = 2;

pub fn render_str(template: &str, context: &RenderContext) -> Result<String, ManifestError> {
    let mut env = Environment::new();
    // A typo in a template must not deploy an empty image or name.
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
    Ok(env.render_str(template, context)?)
}

/// Render the template file into a uniquely named scratch manifest under the
/// system temp directory. The caller removes it after applying.
pub fn render_to_scratch(
    template_path: &Path,
    context: &RenderContext,
) -> Result<PathBuf, ManifestError> {
    let source =
        std::fs::read_to_string(template_path).map_err(|e| ManifestError::Read {
            path: template_path.display().to_string(),
            source: e,
        })?;
    let rendered = render_str(&source, context)?;
    let scratch = std::env::temp_dir().join(format!("skiff-manifest-{}.yml", Uuid::new_v4()));
    std::fs::write(&scratch, rendered.as_bytes()).map_err(|e| ManifestError::Write {
        path: scratch.display().to_string(),
        source: e,
    })?;
    Ok(scratch)
}
