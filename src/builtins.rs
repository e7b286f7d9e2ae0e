//! The builtin library
//!
//! Builtins are the only way a script reaches the host: files, processes,
//! the network and the clock. Each one is described by a
//! [`BuiltinDescriptor`] (name, parameter shapes, implementation) and a
//! runtime exposes exactly the descriptors of the [`BuiltinLibrary`] it was
//! given.
//!
//! Operational failures never raise script errors. They come back as values
//! (`false`, an empty byte array, an unsuccessful [`ExecResponse`]) and are
//! logged at `warn`. Only a wrong argument count or shape is an error.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use crate::error::{EngineError, ErrorKind};
use crate::marshal::{Arg, HostValue, ParamShape};
use crate::validator::Script;

/// What a builtin can see of its caller
pub struct CallContext<'a> {
    /// Name of the script function that made the call (`<script>` at top level)
    pub caller: &'a str,
    /// Resources embedded by the ahead-of-time compiler
    pub assets: &'a AssetTable,
}

/// Implementation of a builtin; `args` already match the declared shapes
pub type BuiltinFn = fn(&CallContext<'_>, &[Arg]) -> Result<HostValue, ErrorKind>;

/// A named host capability with its parameter shapes
#[derive(Clone)]
pub struct BuiltinDescriptor {
    pub name: String,
    pub params: Vec<ParamShape>,
    pub func: BuiltinFn,
}

impl BuiltinDescriptor {
    pub fn new(name: &str, params: &[ParamShape], func: BuiltinFn) -> Self {
        Self {
            name: name.to_string(),
            params: params.to_vec(),
            func,
        }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// `Name(shape, shape)`
    pub fn signature(&self) -> String {
        let params: Vec<String> = self.params.iter().map(ParamShape::to_string).collect();
        format!("{}({})", self.name, params.join(", "))
    }
}

impl fmt::Debug for BuiltinDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<builtin {}>", self.signature())
    }
}

/// Embedded resources addressable by name through `Asset(name)`
#[derive(Debug, Clone, Default)]
pub struct AssetTable {
    entries: BTreeMap<String, Vec<u8>>,
}

impl AssetTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an asset
    pub fn insert(&mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.entries.insert(name.into(), bytes.into());
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of `Exec`, seen by scripts as a record with these fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResponse {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub code: i32,
}

impl ExecResponse {
    /// Run `command` with `args` to completion, capturing its output.
    ///
    /// A command that cannot be started yields `success = false`, `code = -1`
    /// and the launch error in `stderr`.
    pub fn run(command: &str, args: &[String]) -> Self {
        match Command::new(command).args(args).output() {
            Ok(output) => Self {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                success: output.status.success(),
                code: output.status.code().unwrap_or(-1),
            },
            Err(e) => {
                warn!(command, error = %e, "Exec could not start command");
                Self {
                    stdout: String::new(),
                    stderr: e.to_string(),
                    success: false,
                    code: -1,
                }
            }
        }
    }

    /// Read a response back from its record form
    pub fn from_host(value: &HostValue) -> Option<Self> {
        Some(Self {
            stdout: value.get("stdout")?.as_str()?.to_string(),
            stderr: value.get("stderr")?.as_str()?.to_string(),
            success: value.get("success")?.as_bool()?,
            code: i32::try_from(value.get("code")?.to_integer()?).ok()?,
        })
    }
}

impl From<ExecResponse> for HostValue {
    fn from(response: ExecResponse) -> Self {
        HostValue::record([
            ("stdout", HostValue::String(response.stdout)),
            ("stderr", HostValue::String(response.stderr)),
            ("success", HostValue::Bool(response.success)),
            ("code", HostValue::Number(response.code as f64)),
        ])
    }
}

/// An ordered set of builtins with unique names
#[derive(Debug, Clone, Default)]
pub struct BuiltinLibrary {
    descriptors: Vec<BuiltinDescriptor>,
}

impl BuiltinLibrary {
    /// An empty library
    pub fn new() -> Self {
        Self::default()
    }

    /// The vetted library every runtime is offered
    pub fn standard() -> Self {
        use ParamShape::*;

        let descriptors = vec![
            BuiltinDescriptor::new("MD5", &[String], md5_hex),
            BuiltinDescriptor::new("CopyFile", &[String, String], copy_file),
            BuiltinDescriptor::new("AppendFile", &[String, Bytes], append_file),
            BuiltinDescriptor::new("WriteFile", &[String, Bytes], write_file),
            BuiltinDescriptor::new("ReadFile", &[String], read_file),
            BuiltinDescriptor::new("ReplaceInFile", &[String, String, String], replace_in_file),
            BuiltinDescriptor::new("DeleteFile", &[String], delete_file),
            BuiltinDescriptor::new("RetrieveFileFromURL", &[String], retrieve_file_from_url),
            BuiltinDescriptor::new("Timestamp", &[], timestamp),
            BuiltinDescriptor::new("Exec", &[String, Strings], exec),
            BuiltinDescriptor::new("CPUStats", &[], cpu_stats),
            BuiltinDescriptor::new("CalledBy", &[], called_by),
            BuiltinDescriptor::new("Asset", &[String], asset),
            BuiltinDescriptor::new("LogInfo", &[String], log_info),
            BuiltinDescriptor::new("LogError", &[String], log_error),
        ];

        Self { descriptors }
    }

    /// Add a builtin; names must be unique
    pub fn register(&mut self, descriptor: BuiltinDescriptor) -> Result<(), EngineError> {
        if self.get(&descriptor.name).is_some() {
            return Err(EngineError::DuplicateBuiltin(descriptor.name));
        }
        self.descriptors.push(descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&BuiltinDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.descriptors.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BuiltinDescriptor> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// The builtins named in `names`, in library order; unknown names are ignored
    pub fn subset<S: AsRef<str>>(&self, names: &[S]) -> Self {
        let descriptors = self
            .descriptors
            .iter()
            .filter(|d| names.iter().any(|n| n.as_ref() == d.name))
            .cloned()
            .collect();
        Self { descriptors }
    }

    /// Names of the builtins `script` mentions anywhere, in library order
    pub fn referenced_by(&self, script: &Script) -> Vec<String> {
        let referenced = script.referenced_identifiers();
        self.descriptors
            .iter()
            .filter(|d| referenced.contains(d.name.as_str()))
            .map(|d| d.name.clone())
            .collect()
    }
}

// ==================== Implementations ====================

fn unexpected(name: &str) -> ErrorKind {
    ErrorKind::RuntimeError(format!("{}() received arguments it did not declare", name))
}

fn md5_hex(_: &CallContext<'_>, args: &[Arg]) -> Result<HostValue, ErrorKind> {
    match args {
        [Arg::String(data)] => Ok(HostValue::String(format!("{:x}", md5::compute(data.as_bytes())))),
        _ => Err(unexpected("MD5")),
    }
}

fn copy_file(_: &CallContext<'_>, args: &[Arg]) -> Result<HostValue, ErrorKind> {
    match args {
        [Arg::String(src), Arg::String(dst)] => {
            // Read fully before writing so copying a file onto itself keeps it
            let result = fs::read(src).and_then(|bytes| fs::write(dst, bytes));
            Ok(HostValue::Bool(match result {
                Ok(()) => true,
                Err(e) => {
                    warn!(src = %src, dst = %dst, error = %e, "CopyFile failed");
                    false
                }
            }))
        }
        _ => Err(unexpected("CopyFile")),
    }
}

fn append_file(_: &CallContext<'_>, args: &[Arg]) -> Result<HostValue, ErrorKind> {
    match args {
        [Arg::String(path), Arg::Bytes(data)] => {
            let result = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut file| file.write_all(data));
            Ok(HostValue::Bool(report("AppendFile", path, result)))
        }
        _ => Err(unexpected("AppendFile")),
    }
}

fn write_file(_: &CallContext<'_>, args: &[Arg]) -> Result<HostValue, ErrorKind> {
    match args {
        [Arg::String(path), Arg::Bytes(data)] => {
            Ok(HostValue::Bool(report("WriteFile", path, fs::write(path, data))))
        }
        _ => Err(unexpected("WriteFile")),
    }
}

fn read_file(_: &CallContext<'_>, args: &[Arg]) -> Result<HostValue, ErrorKind> {
    match args {
        [Arg::String(path)] => Ok(HostValue::Bytes(fs::read(path).unwrap_or_else(|e| {
            warn!(path = %path, error = %e, "ReadFile failed");
            Vec::new()
        }))),
        _ => Err(unexpected("ReadFile")),
    }
}

fn replace_in_file(_: &CallContext<'_>, args: &[Arg]) -> Result<HostValue, ErrorKind> {
    match args {
        [Arg::String(path), Arg::String(old), Arg::String(new)] => {
            let result = fs::read(path)
                .and_then(|contents| fs::write(path, replace_bytes(&contents, old.as_bytes(), new.as_bytes())));
            Ok(HostValue::Bool(report("ReplaceInFile", path, result)))
        }
        _ => Err(unexpected("ReplaceInFile")),
    }
}

/// Replace every non-overlapping occurrence of `old`; an empty `old` matches nothing
fn replace_bytes(haystack: &[u8], old: &[u8], new: &[u8]) -> Vec<u8> {
    if old.is_empty() {
        return haystack.to_vec();
    }

    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(pos) = rest.windows(old.len()).position(|w| w == old) {
        out.extend_from_slice(&rest[..pos]);
        out.extend_from_slice(new);
        rest = &rest[pos + old.len()..];
    }
    out.extend_from_slice(rest);
    out
}

fn delete_file(_: &CallContext<'_>, args: &[Arg]) -> Result<HostValue, ErrorKind> {
    match args {
        [Arg::String(path)] => Ok(HostValue::Bool(report("DeleteFile", path, fs::remove_file(path)))),
        _ => Err(unexpected("DeleteFile")),
    }
}

fn retrieve_file_from_url(_: &CallContext<'_>, args: &[Arg]) -> Result<HostValue, ErrorKind> {
    match args {
        [Arg::String(url)] => Ok(HostValue::Bytes(fetch(url).unwrap_or_else(|e| {
            warn!(url = %url, error = %e, "RetrieveFileFromURL failed");
            Vec::new()
        }))),
        _ => Err(unexpected("RetrieveFileFromURL")),
    }
}

/// GET `url`; non-2xx statuses are errors
fn fetch(url: &str) -> Result<Vec<u8>, String> {
    let agent = ureq::Agent::new();
    let response = agent.get(url).call().map_err(|e| e.to_string())?;
    let mut body = Vec::new();
    response
        .into_reader()
        .read_to_end(&mut body)
        .map_err(|e| e.to_string())?;
    debug!(url, bytes = body.len(), "retrieved");
    Ok(body)
}

/// Largest timestamp handed out so far in this process
static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// Epoch seconds, never smaller than a previously returned value
pub fn monotonic_timestamp() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    LAST_TIMESTAMP.fetch_max(now, Ordering::SeqCst).max(now)
}

fn timestamp(_: &CallContext<'_>, _: &[Arg]) -> Result<HostValue, ErrorKind> {
    Ok(HostValue::Number(monotonic_timestamp() as f64))
}

fn exec(_: &CallContext<'_>, args: &[Arg]) -> Result<HostValue, ErrorKind> {
    match args {
        [Arg::String(command), Arg::Strings(argv)] => {
            debug!(command = %command, args = ?argv, "Exec");
            Ok(ExecResponse::run(command, argv).into())
        }
        _ => Err(unexpected("Exec")),
    }
}

fn cpu_stats(_: &CallContext<'_>, _: &[Arg]) -> Result<HostValue, ErrorKind> {
    Ok(HostValue::Bool(true))
}

fn called_by(ctx: &CallContext<'_>, _: &[Arg]) -> Result<HostValue, ErrorKind> {
    Ok(HostValue::String(ctx.caller.to_string()))
}

fn asset(ctx: &CallContext<'_>, args: &[Arg]) -> Result<HostValue, ErrorKind> {
    match args {
        [Arg::String(name)] => Ok(HostValue::Bytes(match ctx.assets.get(name) {
            Some(bytes) => bytes.to_vec(),
            None => {
                warn!(asset = %name, "unknown asset");
                Vec::new()
            }
        })),
        _ => Err(unexpected("Asset")),
    }
}

fn log_info(ctx: &CallContext<'_>, args: &[Arg]) -> Result<HostValue, ErrorKind> {
    match args {
        [Arg::String(message)] => {
            info!(target: "gscript::script", caller = ctx.caller, "{}", message);
            Ok(HostValue::Bool(true))
        }
        _ => Err(unexpected("LogInfo")),
    }
}

fn log_error(ctx: &CallContext<'_>, args: &[Arg]) -> Result<HostValue, ErrorKind> {
    match args {
        [Arg::String(message)] => {
            error!(target: "gscript::script", caller = ctx.caller, "{}", message);
            Ok(HostValue::Bool(true))
        }
        _ => Err(unexpected("LogError")),
    }
}

/// Collapse an I/O result to a success flag, logging the failure
fn report(builtin: &str, path: &str, result: std::io::Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(builtin, path, error = %e, "file operation failed");
            false
        }
    }
}
