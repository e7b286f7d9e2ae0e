//! Ahead-of-time packaging
//!
//! [`compile`] turns a validated script and its resource files into a
//! standalone Cargo package whose `main` embeds both and drives a
//! [`Runtime`](crate::runtime::Runtime) through the execution plan. The tree
//! is assembled in a staging directory beside the output and moved into
//! place only once complete.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::builtins::BuiltinLibrary;
use crate::error::CompileError;
use crate::validator;

/// Where the generated package gets the `gscript` crate from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeDependency {
    /// A registry version requirement
    Registry(String),
    /// A local checkout
    Path(PathBuf),
}

impl Default for RuntimeDependency {
    fn default() -> Self {
        RuntimeDependency::Registry(crate::VERSION.to_string())
    }
}

impl RuntimeDependency {
    fn manifest_entry(&self) -> String {
        match self {
            RuntimeDependency::Registry(version) => {
                format!("{{ version = {}, default-features = false }}", toml_string(version))
            }
            RuntimeDependency::Path(path) => {
                format!("{{ path = {}, default-features = false }}", toml_string(&path.to_string_lossy()))
            }
        }
    }
}

/// Everything needed to package one script
#[derive(Debug, Clone)]
pub struct CompilerJob {
    pub script: PathBuf,
    pub name: String,
    pub output_dir: PathBuf,
    pub resources: Vec<PathBuf>,
    pub runtime: RuntimeDependency,
}

impl CompilerJob {
    /// A job named after the script's file stem, written next to the script
    pub fn new(script: impl Into<PathBuf>) -> Self {
        let script = script.into();
        let name = script
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        let output_dir = script.with_file_name(format!("{}-build", name));

        Self {
            script,
            name,
            output_dir,
            resources: Vec::new(),
            runtime: RuntimeDependency::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_resource(mut self, path: impl Into<PathBuf>) -> Self {
        self.resources.push(path.into());
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeDependency) -> Self {
        self.runtime = runtime;
        self
    }
}

/// A package written by [`compile`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedTree {
    pub root: PathBuf,
    /// Crate and binary name
    pub name: String,
    /// Builtins the entry point registers
    pub builtins: Vec<String>,
    /// Embedded asset names, in resource order
    pub assets: Vec<String>,
}

impl GeneratedTree {
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("Cargo.toml")
    }

    pub fn entry_point(&self) -> PathBuf {
        self.root.join("src").join("main.rs")
    }
}

struct Asset {
    name: String,
    bytes: Vec<u8>,
}

/// Package `job` into a new directory at `job.output_dir`
pub fn compile(job: &CompilerJob) -> Result<GeneratedTree, CompileError> {
    info!(script = %job.script.display(), output = %job.output_dir.display(), "compiling");

    let source = fs::read_to_string(&job.script).map_err(|source| CompileError::ReadScript {
        path: job.script.clone(),
        source,
    })?;
    let script = validator::validate(&source).map_err(|error| CompileError::Syntax {
        path: job.script.clone(),
        error,
    })?;

    // Every input is read before anything is written
    let mut assets: Vec<Asset> = Vec::with_capacity(job.resources.len());
    for path in &job.resources {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        if assets.iter().any(|a| a.name == name) {
            return Err(CompileError::DuplicateAsset(name));
        }
        let bytes = fs::read(path).map_err(|source| CompileError::Resource {
            path: path.clone(),
            source,
        })?;
        debug!(asset = %name, bytes = bytes.len(), "resource read");
        assets.push(Asset { name, bytes });
    }

    let builtins = BuiltinLibrary::standard().referenced_by(&script);
    let crate_name = crate_name(&job.name);

    if job.output_dir.exists() {
        return Err(CompileError::OutputExists(job.output_dir.clone()));
    }

    let parent = match job.output_dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(io_error(format!("cannot create {}", parent.display())))?;

    let staging = tempfile::Builder::new()
        .prefix(".gscript-stage-")
        .tempdir_in(&parent)
        .map_err(io_error(format!("cannot create a staging directory in {}", parent.display())))?;
    let stage = staging.path();

    write(&stage.join("Cargo.toml"), manifest(&crate_name, &job.runtime).as_bytes())?;
    write(&stage.join("src").join("script.gs"), source.as_bytes())?;
    for (index, asset) in assets.iter().enumerate() {
        write(&stage.join("assets").join(asset_file(index, &asset.name)), &asset.bytes)?;
    }
    write(
        &stage.join("src").join("main.rs"),
        entry_point(&crate_name, &builtins, &assets).as_bytes(),
    )?;

    fs::rename(stage, &job.output_dir)
        .map_err(io_error(format!("cannot move the package to {}", job.output_dir.display())))?;
    // The staging directory is gone; dropping the guard is a no-op

    let tree = GeneratedTree {
        root: job.output_dir.clone(),
        name: crate_name,
        builtins,
        assets: assets.into_iter().map(|a| a.name).collect(),
    };
    info!(root = %tree.root.display(), builtins = ?tree.builtins, assets = tree.assets.len(), "package generated");
    Ok(tree)
}

/// Run `program args...` inside the generated package
pub fn invoke_toolchain(tree: &GeneratedTree, program: &str, args: &[&str]) -> Result<(), CompileError> {
    let command = std::iter::once(program).chain(args.iter().copied()).collect::<Vec<_>>().join(" ");
    info!(command = %command, root = %tree.root.display(), "invoking toolchain");

    let output = Command::new(program)
        .args(args)
        .current_dir(&tree.root)
        .output()
        .map_err(|e| CompileError::Toolchain {
            command: command.clone(),
            detail: e.to_string(),
        })?;

    debug!(stdout = %String::from_utf8_lossy(&output.stdout), "toolchain output");
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(CompileError::Toolchain {
        command,
        detail: if stderr.is_empty() { output.status.to_string() } else { stderr },
    })
}

fn write(path: &Path, contents: &[u8]) -> Result<(), CompileError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(io_error(format!("cannot create {}", dir.display())))?;
    }
    fs::write(path, contents).map_err(io_error(format!("cannot write {}", path.display())))
}

fn io_error(context: String) -> impl FnOnce(std::io::Error) -> CompileError {
    move |source| CompileError::Io { context, source }
}

/// A valid Cargo package name derived from `name`
fn crate_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let out = out.trim_matches('-');

    if out.is_empty() {
        "gscript-artifact".to_string()
    } else if out.starts_with(|c: char| c.is_ascii_digit()) {
        format!("gs-{}", out)
    } else {
        out.to_string()
    }
}

fn asset_file(index: usize, name: &str) -> String {
    format!("{}_{}", index, name)
}

fn toml_string(s: &str) -> String {
    toml::Value::String(s.to_string()).to_string()
}

fn manifest(crate_name: &str, runtime: &RuntimeDependency) -> String {
    format!(
        r#"[package]
name = {name}
version = "0.1.0"
edition = "2021"
publish = false

[[bin]]
name = {name}
path = "src/main.rs"

[dependencies]
gscript = {runtime}
tracing = "0.1"

[workspace]
"#,
        name = toml_string(crate_name),
        runtime = runtime.manifest_entry(),
    )
}

fn entry_point(crate_name: &str, builtins: &[String], assets: &[Asset]) -> String {
    let builtin_list = builtins.iter().map(|b| format!("{:?}", b)).collect::<Vec<_>>().join(", ");

    let mut asset_consts = String::new();
    let mut asset_table = String::new();
    for (index, asset) in assets.iter().enumerate() {
        let file = format!("../assets/{}", asset_file(index, &asset.name));
        let _ = writeln!(asset_consts, "const ASSET_{}: &[u8] = include_bytes!({:?});", index, file);
        let _ = writeln!(asset_table, "    ({:?}, ASSET_{}),", asset.name, index);
    }

    format!(
        r#"//! Generated by gscript {version}. Edits are overwritten on the next compile.

use std::process::ExitCode;

use gscript::builtins::{{AssetTable, BuiltinLibrary}};
use gscript::logging::{{self, Verbosity}};
use gscript::plan::ExecutionPlan;
use gscript::runtime::Runtime;
use gscript::EngineError;
use tracing::{{error, info}};

const SCRIPT: &str = include_str!("script.gs");

const BUILTINS: &[&str] = &[{builtin_list}];

{asset_consts}
const ASSETS: &[(&str, &[u8])] = &[
{asset_table}];

fn main() -> ExitCode {{
    logging::init(Verbosity::Normal);
    match run() {{
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {{
            error!("{{}}", err);
            ExitCode::FAILURE
        }}
    }}
}}

fn run() -> Result<(), EngineError> {{
    let mut assets = AssetTable::new();
    for (name, bytes) in ASSETS {{
        assets.insert(*name, *bytes);
    }}

    let mut runtime = Runtime::with_assets(assets);
    runtime.register_builtins(&BuiltinLibrary::standard().subset(BUILTINS))?;
    runtime.load(SCRIPT)?;
    runtime.run()?;

    let report = ExecutionPlan::discover(&runtime)?.execute(&mut runtime)?;
    info!(completed = ?report.completed, {name:?});
    Ok(())
}}
"#,
        version = crate::VERSION,
        name = format!("{} finished", crate_name),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_name_sanitizing() {
        assert_eq!(crate_name("Deploy Agent"), "deploy-agent");
        assert_eq!(crate_name("1st"), "gs-1st");
        assert_eq!(crate_name("***"), "gscript-artifact");
        assert_eq!(crate_name("my_tool"), "my_tool");
    }

    #[test]
    fn test_manifest_quotes_paths() {
        let runtime = RuntimeDependency::Path(PathBuf::from("/opt/gscript \"dev\""));
        let manifest = manifest("agent", &runtime);
        let parsed: toml::Value = toml::from_str(&manifest).unwrap();
        assert_eq!(
            parsed["dependencies"]["gscript"]["path"].as_str(),
            Some("/opt/gscript \"dev\"")
        );
        assert_eq!(
            parsed["dependencies"]["gscript"]["default-features"].as_bool(),
            Some(false)
        );
        assert_eq!(parsed["package"]["name"].as_str(), Some("agent"));
    }

    #[test]
    fn test_entry_point_embeds_selected_builtins_and_assets() {
        let assets = vec![Asset { name: "payload.bin".to_string(), bytes: vec![1] }];
        let main = entry_point("agent", &["MD5".to_string()], &assets);
        assert!(main.contains(r#"const BUILTINS: &[&str] = &["MD5"];"#));
        assert!(main.contains(r#"const ASSET_0: &[u8] = include_bytes!("../assets/0_payload.bin");"#));
        assert!(main.contains(r#"("payload.bin", ASSET_0),"#));
    }

    #[test]
    fn test_job_defaults_from_script_path() {
        let job = CompilerJob::new("/work/deploy.gs");
        assert_eq!(job.name, "deploy");
        assert_eq!(job.output_dir, PathBuf::from("/work/deploy-build"));
        assert_eq!(job.runtime, RuntimeDependency::Registry(crate::VERSION.to_string()));
    }
}
