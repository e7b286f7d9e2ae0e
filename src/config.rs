//! TOML compile manifests
//!
//! A manifest records how a script is packaged so `gscript compile
//! --manifest gscript.toml` is repeatable:
//!
//! ```toml
//! name = "deploy-agent"
//! output = "dist/agent"
//! assets = ["files/payload.bin", "files/config.json"]
//! runtime_path = "../gscript"
//! ```
//!
//! Relative paths are resolved against the manifest's directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::aot::{CompilerJob, RuntimeDependency};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Packaging options read from a manifest file
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub name: Option<String>,
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub assets: Vec<PathBuf>,
    pub runtime_path: Option<PathBuf>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay the manifest onto `job`; assets are appended after the job's own
    pub fn apply(&self, mut job: CompilerJob, base_dir: &Path) -> CompilerJob {
        if let Some(name) = &self.name {
            job.name = name.clone();
        }
        if let Some(output) = &self.output {
            job.output_dir = resolve(base_dir, output);
        }
        job.resources
            .extend(self.assets.iter().map(|asset| resolve(base_dir, asset)));
        if let Some(runtime) = &self.runtime_path {
            job.runtime = RuntimeDependency::Path(resolve(base_dir, runtime));
        }
        job
    }
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_manifest() {
        let manifest = Manifest::parse(
            r#"
            name = "agent"
            output = "dist"
            assets = ["a.bin", "/abs/b.bin"]
            runtime_path = "../gscript"
            "#,
        )
        .unwrap();

        let job = manifest.apply(CompilerJob::new("/work/deploy.gs"), Path::new("/work"));
        assert_eq!(job.name, "agent");
        assert_eq!(job.output_dir, PathBuf::from("/work/dist"));
        assert_eq!(job.resources, vec![PathBuf::from("/work/a.bin"), PathBuf::from("/abs/b.bin")]);
        assert_eq!(job.runtime, RuntimeDependency::Path(PathBuf::from("/work/../gscript")));
    }

    #[test]
    fn test_empty_manifest_changes_nothing() {
        let manifest = Manifest::parse("").unwrap();
        let job = manifest.apply(CompilerJob::new("deploy.gs"), Path::new("."));
        assert_eq!(job.name, "deploy");
        assert!(job.resources.is_empty());
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        assert!(matches!(Manifest::parse("nmae = \"typo\""), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file() {
        let err = Manifest::load(Path::new("/nonexistent/gscript.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
