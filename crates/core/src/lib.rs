//! Shared building blocks: image tag helpers and the console printer seam.

#![forbid(unsafe_code)]

use std::sync::Mutex;

use thiserror::Error;

/// Parts of a fully qualified image tag, `registry/repository:version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagComponents {
    pub domain: String,
    pub repository: String,
    pub version: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TagError {
    #[error("malformed image tag {0:?}: expected registry/repository:version")]
    Malformed(String),
}

/// Assemble the tag an image is built, pushed, and deployed under.
pub fn make_tag(registry: &str, name: &str, version: &str) -> String {
    format!("{registry}/{name}:{version}")
}

/// Split a tag back into its components. The registry part ends at the first
/// slash, the version starts at the first colon after it.
pub fn tag_components(tag: &str) -> Result<TagComponents, TagError> {
    let (domain, rest) = tag
        .split_once('/')
        .ok_or_else(|| TagError::Malformed(tag.to_string()))?;
    let (repository, version) = rest
        .split_once(':')
        .ok_or_else(|| TagError::Malformed(tag.to_string()))?;
    Ok(TagComponents {
        domain: domain.to_string(),
        repository: repository.to_string(),
        version: version.to_string(),
    })
}

/// Where user-facing lines go. Components report progress and failures
/// through this instead of printing, so the CLI decides decoration and tests
/// capture output.
pub trait Printer: Send + Sync {
    fn line_at(&self, msg: &str, indent: usize);
    fn error_at(&self, msg: &str, indent: usize);

    fn line(&self, msg: &str) {
        self.line_at(msg, 0);
    }

    fn error(&self, msg: &str) {
        self.error_at(msg, 0);
    }
}

/// One captured line of console output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintedLine {
    pub error: bool,
    pub indent: usize,
    pub msg: String,
}

/// Printer that records everything; the assertion side of the seam.
#[derive(Debug, Default)]
pub struct BufferPrinter {
    entries: Mutex<Vec<PrintedLine>>,
}

impl BufferPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<PrintedLine> {
        self.entries.lock().unwrap().clone()
    }

    /// Non-error messages, in order.
    pub fn infos(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|l| !l.error)
            .map(|l| l.msg)
            .collect()
    }

    /// Error messages, in order.
    pub fn errors(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|l| l.error)
            .map(|l| l.msg)
            .collect()
    }
}

impl Printer for BufferPrinter {
    fn line_at(&self, msg: &str, indent: usize) {
        self.entries.lock().unwrap().push(PrintedLine {
            error: false,
            indent,
            msg: msg.to_string(),
        });
    }

    fn error_at(&self, msg: &str, indent: usize) {
        self.entries.lock().unwrap().push(PrintedLine {
            error: true,
            indent,
            msg: msg.to_string(),
        });
    }
}
