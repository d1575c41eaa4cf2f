#![forbid(unsafe_code)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nsalloc_contracts::allocation::NamespaceName;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_ENV_FILE: &str = "bastion_parameters.env";
const NAMESPACE_KEY: &str = "NAMESPACE=";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to update {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Hands a granted namespace to whatever runs next in the pipeline.
pub trait OutputChannel {
    fn publish(&self, namespace: &NamespaceName) -> Result<(), PublishError>;
}

/// Writes `NAMESPACE=<name>` into an env file, replacing any existing assignment.
#[derive(Debug, Clone)]
pub struct EnvFilePublisher {
    path: PathBuf,
}

impl EnvFilePublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OutputChannel for EnvFilePublisher {
    fn publish(&self, namespace: &NamespaceName) -> Result<(), PublishError> {
        let io_err = |source| PublishError::Io {
            path: self.path.clone(),
            source,
        };
        let existing = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(io_err(err)),
        };
        let updated = upsert_namespace_line(&existing, namespace.as_str());
        fs::write(&self.path, updated).map_err(io_err)?;
        debug!(path = %self.path.display(), namespace = %namespace, "namespace published");
        Ok(())
    }
}

fn upsert_namespace_line(existing: &str, namespace: &str) -> String {
    let assignment = format!("{NAMESPACE_KEY}{namespace}");
    let mut replaced = false;
    let mut lines: Vec<String> = existing
        .lines()
        .filter_map(|line| {
            if line.trim_start().starts_with(NAMESPACE_KEY) {
                if replaced {
                    return None;
                }
                replaced = true;
                Some(assignment.clone())
            } else {
                Some(line.to_string())
            }
        })
        .collect();
    if !replaced {
        lines.push(assignment);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutPublisher;

impl OutputChannel for StdoutPublisher {
    fn publish(&self, namespace: &NamespaceName) -> Result<(), PublishError> {
        println!("{namespace}");
        Ok(())
    }
}
