use std::fs;
use std::path::Path;

use gscript::aot::{self, CompilerJob, RuntimeDependency};
use gscript::CompileError;

fn write_script(dir: &Path, name: &str, source: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, source).unwrap();
    path
}

/// Entries of `dir`, hidden ones included
fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

const DEPLOY: &str = r#"
fn Deploy() {
    let banner = Asset("banner.txt")
    LogInfo("deploying " + MD5("helloworld"))
    return len(banner) > 0
}
"#;

#[test]
fn test_generated_tree_layout() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "deploy.gs", DEPLOY);
    let banner = dir.path().join("banner.txt");
    fs::write(&banner, "welcome").unwrap();

    let job = CompilerJob::new(&script).with_resource(&banner);
    let tree = aot::compile(&job).unwrap();

    assert_eq!(tree.root, dir.path().join("deploy-build"));
    assert_eq!(tree.name, "deploy");
    assert_eq!(tree.builtins, vec!["MD5", "Asset", "LogInfo"]);
    assert_eq!(tree.assets, vec!["banner.txt"]);

    assert_eq!(fs::read_to_string(tree.root.join("src/script.gs")).unwrap(), DEPLOY);
    assert_eq!(fs::read(tree.root.join("assets/0_banner.txt")).unwrap(), b"welcome");

    let manifest: toml::Value = toml::from_str(&fs::read_to_string(tree.manifest_path()).unwrap()).unwrap();
    assert_eq!(manifest["package"]["name"].as_str(), Some("deploy"));
    assert_eq!(
        manifest["dependencies"]["gscript"]["version"].as_str(),
        Some(gscript::VERSION)
    );
    // Packaged agents leave out the interactive binary's dependencies
    assert_eq!(
        manifest["dependencies"]["gscript"]["default-features"].as_bool(),
        Some(false)
    );

    let main = fs::read_to_string(tree.entry_point()).unwrap();
    assert!(main.contains(r#"const BUILTINS: &[&str] = &["MD5", "Asset", "LogInfo"];"#));
    assert!(main.contains(r#"include_str!("script.gs")"#));
    assert!(main.contains(r#"("banner.txt", ASSET_0)"#));
    assert!(!main.contains("\"Exec\""));

    // Only the package is left next to the inputs
    assert_eq!(entries(dir.path()), vec!["banner.txt", "deploy-build", "deploy.gs"]);
}

#[test]
fn test_custom_name_output_and_local_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "job.gs", "fn Deploy() { return true }");
    let output = dir.path().join("out").join("agent");

    let job = CompilerJob::new(&script)
        .with_name("Release Agent")
        .with_output_dir(&output)
        .with_runtime(RuntimeDependency::Path("/src/gscript".into()));
    let tree = aot::compile(&job).unwrap();

    assert_eq!(tree.root, output);
    assert_eq!(tree.name, "release-agent");
    assert!(tree.builtins.is_empty());

    let manifest: toml::Value = toml::from_str(&fs::read_to_string(tree.manifest_path()).unwrap()).unwrap();
    assert_eq!(manifest["dependencies"]["gscript"]["path"].as_str(), Some("/src/gscript"));
    assert_eq!(manifest["bin"][0]["name"].as_str(), Some("release-agent"));
}

#[test]
fn test_syntax_error_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "broken.gs", "fn Deploy( {");

    let err = aot::compile(&CompilerJob::new(&script)).unwrap_err();
    assert!(matches!(err, CompileError::Syntax { .. }));
    assert_eq!(entries(dir.path()), vec!["broken.gs"]);
}

#[test]
fn test_missing_resource_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "deploy.gs", DEPLOY);
    let job = CompilerJob::new(&script).with_resource(dir.path().join("banner.txt"));

    let err = aot::compile(&job).unwrap_err();
    assert!(matches!(err, CompileError::Resource { .. }));
    assert_eq!(entries(dir.path()), vec!["deploy.gs"]);
}

#[test]
fn test_duplicate_asset_names() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "deploy.gs", DEPLOY);
    fs::create_dir(dir.path().join("a")).unwrap();
    fs::create_dir(dir.path().join("b")).unwrap();
    fs::write(dir.path().join("a/banner.txt"), "one").unwrap();
    fs::write(dir.path().join("b/banner.txt"), "two").unwrap();

    let job = CompilerJob::new(&script)
        .with_resource(dir.path().join("a/banner.txt"))
        .with_resource(dir.path().join("b/banner.txt"));
    let err = aot::compile(&job).unwrap_err();
    assert!(matches!(err, CompileError::DuplicateAsset(ref name) if name == "banner.txt"));
    assert!(!job.output_dir.exists());
}

#[test]
fn test_existing_output_is_not_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "deploy.gs", "let x = 1");
    let output = dir.path().join("deploy-build");
    fs::create_dir(&output).unwrap();
    fs::write(output.join("keep.txt"), "mine").unwrap();

    let err = aot::compile(&CompilerJob::new(&script)).unwrap_err();
    assert!(matches!(err, CompileError::OutputExists(_)));
    assert_eq!(entries(&output), vec!["keep.txt"]);
}

#[test]
fn test_missing_script() {
    let dir = tempfile::tempdir().unwrap();
    let err = aot::compile(&CompilerJob::new(dir.path().join("nope.gs"))).unwrap_err();
    assert!(matches!(err, CompileError::ReadScript { .. }));
}

#[test]
fn test_toolchain_runs_in_package_root() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "deploy.gs", "let x = 1");
    let tree = aot::compile(&CompilerJob::new(&script)).unwrap();

    aot::invoke_toolchain(&tree, "test", &["-f", "Cargo.toml"]).unwrap();

    let err = aot::invoke_toolchain(&tree, "false", &[]).unwrap_err();
    assert!(matches!(err, CompileError::Toolchain { ref command, .. } if command == "false"));

    let err = aot::invoke_toolchain(&tree, "/nonexistent/cargo", &["build"]).unwrap_err();
    assert!(matches!(err, CompileError::Toolchain { ref command, .. } if command == "/nonexistent/cargo build"));
}
