//! Payload shapes of the session level messages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

use crate::collaborators::UnresolvedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileKind {
    Code,
    /// Base64 encoded binary contents.
    Asset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFile {
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub contents: String,
}

impl CodeFile {
    pub fn code(contents: impl Into<String>) -> Self {
        Self {
            kind: FileKind::Code,
            contents: contents.into(),
        }
    }

    pub fn asset(base64: impl Into<String>) -> Self {
        Self {
            kind: FileKind::Asset,
            contents: base64.into(),
        }
    }
}

/// Project files keyed by path.
pub type CodeFiles = BTreeMap<String, CodeFile>;

pub fn has_assets(files: &CodeFiles) -> bool {
    files.values().any(|file| file.kind == FileKind::Asset)
}

/// Files a runtime without binary payload support can load.
pub fn source_only(files: &CodeFiles) -> CodeFiles {
    files
        .iter()
        .filter(|(_, file)| file.kind == FileKind::Code)
        .map(|(path, file)| (path.clone(), file.clone()))
        .collect()
}

pub fn code(files: &CodeFiles) -> Value {
    json!({ "files": files })
}

/// Outcome of resolving one dependency for one runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ResolvedDependency {
    Bundle { version: String, url: String },
    Unresolved { version: String, error: String },
}

impl ResolvedDependency {
    pub fn from_result(version: &str, result: Result<Url, UnresolvedError>) -> Self {
        match result {
            Ok(url) => ResolvedDependency::Bundle {
                version: version.to_string(),
                url: url.to_string(),
            },
            Err(err) => ResolvedDependency::Unresolved {
                version: version.to_string(),
                error: err.to_string(),
            },
        }
    }
}

pub fn dependencies(resolved: &BTreeMap<String, ResolvedDependency>) -> Value {
    json!({ "dependencies": resolved })
}

/// `name -> version` shape understood by runtimes that predate bundle URLs.
pub fn legacy_dependencies(declared: &BTreeMap<String, String>) -> Value {
    json!({ "dependencies": declared })
}
