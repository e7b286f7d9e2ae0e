use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::process::Command;
use std::thread;

use gscript::{run, AssetTable, BuiltinLibrary, EngineError, HostValue, Runtime};

/// A script string literal for `path`
fn lit(path: &Path) -> String {
    format!("{:?}", path.display().to_string())
}

fn runtime_error(source: &str) -> String {
    match run(source) {
        Err(EngineError::Runtime(err)) => err.kind.to_string(),
        other => panic!("expected a runtime error, got {:?}", other),
    }
}

#[test]
fn test_md5_of_helloworld() {
    let result = run(r#"MD5("helloworld")"#).unwrap();
    assert_eq!(result, HostValue::from("fc5e038d38a57032085441e7fe7010b0"));
}

#[test]
fn test_write_append_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");

    let source = format!(
        r#"
        let path = {path}
        let wrote = WriteFile(path, "<html>")
        let appended = AppendFile(path, [60, 47, 62])
        [wrote, appended, len(ReadFile(path))]
        "#,
        path = lit(&path)
    );
    let result = run(&source).unwrap();
    assert_eq!(
        result,
        HostValue::List(vec![HostValue::Bool(true), HostValue::Bool(true), HostValue::Number(9.0)])
    );
    assert_eq!(fs::read_to_string(&path).unwrap(), "<html></>");
}

#[test]
fn test_read_file_concatenates_as_byte_list() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("page.html");
    fs::write(&path, "<html>").unwrap();

    let source = format!(r#""" + ReadFile({})"#, lit(&path));
    assert_eq!(run(&source).unwrap(), HostValue::from("60,104,116,109,108,62"));
}

#[test]
fn test_copy_replace_delete() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("a.conf");
    let dst = dir.path().join("b.conf");
    fs::write(&src, "port=80\nhost=old\n").unwrap();

    let source = format!(
        r#"
        let copied = CopyFile({src}, {dst})
        let replaced = ReplaceInFile({dst}, "old", "new")
        let deleted = DeleteFile({src})
        copied and replaced and deleted
        "#,
        src = lit(&src),
        dst = lit(&dst)
    );
    assert_eq!(run(&source).unwrap(), HostValue::Bool(true));
    assert!(!src.exists());
    assert_eq!(fs::read_to_string(&dst).unwrap(), "port=80\nhost=new\n");
}

#[test]
fn test_file_failures_return_false() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing");

    let source = format!(
        r#"[DeleteFile({m}), CopyFile({m}, {m} + ".bak"), ReplaceInFile({m}, "a", "b"), len(ReadFile({m}))]"#,
        m = lit(&missing)
    );
    assert_eq!(
        run(&source).unwrap(),
        HostValue::List(vec![
            HostValue::Bool(false),
            HostValue::Bool(false),
            HostValue::Bool(false),
            HostValue::Number(0.0),
        ])
    );
}

/// Serve one HTTP response on a local port and return the base URL
fn serve_once(status: &'static str, body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 512];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).unwrap();
    });

    format!("http://{}", addr)
}

#[test]
fn test_retrieve_file_from_url() {
    let url = serve_once("200 OK", "hello");
    let source = format!(r#"RetrieveFileFromURL("{}/file.txt")"#, url);
    assert_eq!(
        run(&source).unwrap(),
        HostValue::List(b"hello".iter().map(|b| HostValue::Number(*b as f64)).collect())
    );
}

#[test]
fn test_retrieve_file_from_url_failure_is_empty() {
    let url = serve_once("404 Not Found", "gone");
    let source = format!(r#"len(RetrieveFileFromURL("{}/missing"))"#, url);
    assert_eq!(run(&source).unwrap(), HostValue::Number(0.0));

    // Nothing listens on port 1
    let result = run(r#"len(RetrieveFileFromURL("http://127.0.0.1:1/"))"#).unwrap();
    assert_eq!(result, HostValue::Number(0.0));
}

#[test]
fn test_exec_matches_direct_invocation() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("one.txt"), "1").unwrap();
    fs::write(dir.path().join("two.txt"), "22").unwrap();
    let target = dir.path().display().to_string();

    let expected = Command::new("ls").args(["-lah", &target]).output().unwrap();

    let source = format!(r#"Exec("ls", ["-lah", {:?}])"#, target);
    let result = run(&source).unwrap();
    assert_eq!(
        result.get("stdout"),
        Some(&HostValue::String(String::from_utf8_lossy(&expected.stdout).into_owned()))
    );
    assert_eq!(result.get("success"), Some(&HostValue::Bool(true)));
    assert_eq!(result.get("code"), Some(&HostValue::Number(0.0)));
}

#[test]
fn test_exec_reports_failures_as_values() {
    let result = run(r#"Exec("false", [])"#).unwrap();
    assert_eq!(result.get("success"), Some(&HostValue::Bool(false)));
    assert_eq!(result.get("code"), Some(&HostValue::Number(1.0)));

    let result = run(r#"Exec("/nonexistent/gscript-command", [])"#).unwrap();
    assert_eq!(result.get("code"), Some(&HostValue::Number(-1.0)));
    assert_ne!(result.get("stderr"), Some(&HostValue::from("")));
}

#[test]
fn test_exec_accepts_numeric_arguments() {
    let result = run(r#"Exec("echo", ["a", 1])"#).unwrap();
    assert_eq!(result.get("stdout"), Some(&HostValue::from("a 1\n")));
}

#[test]
fn test_timestamp_and_cpu_stats() {
    let result = run("[Timestamp(), Timestamp(), CPUStats()]").unwrap();
    let HostValue::List(items) = result else {
        panic!("expected a list");
    };
    let first = items[0].to_number().unwrap();
    let second = items[1].to_number().unwrap();
    assert!(first > 1_600_000_000.0);
    assert!(second >= first);
    assert_eq!(items[2], HostValue::Bool(true));
}

#[test]
fn test_called_by() {
    let source = r#"
        fn Deploy() { return CalledBy() }
        [CalledBy(), Deploy()]
    "#;
    assert_eq!(
        run(source).unwrap(),
        HostValue::List(vec![HostValue::from("<script>"), HostValue::from("Deploy")])
    );
}

#[test]
fn test_asset_lookup() {
    let mut assets = AssetTable::new();
    assets.insert("banner.txt", b"hi".to_vec());

    let mut runtime = Runtime::with_assets(assets);
    runtime.register_builtins(&BuiltinLibrary::standard()).unwrap();
    let result = runtime.eval(r#"[Asset("banner.txt"), len(Asset("other.txt"))]"#).unwrap();
    assert_eq!(
        result,
        HostValue::List(vec![
            HostValue::List(vec![HostValue::Number(104.0), HostValue::Number(105.0)]),
            HostValue::Number(0.0),
        ])
    );
}

#[test]
fn test_log_builtins_return_true() {
    assert_eq!(run(r#"LogInfo("starting") and LogError("oops")"#).unwrap(), HostValue::Bool(true));
}

#[test]
fn test_argument_count_names_builtin() {
    let message = runtime_error(r#"MD5("a", "b")"#);
    assert_eq!(message, "MD5() expects 1 arguments, got 2");
}

#[test]
fn test_argument_type_names_builtin_and_position() {
    let message = runtime_error(r#"WriteFile("/tmp/x", {a: 1})"#);
    assert_eq!(message, "WriteFile() argument 2 must be bytes, got record");

    let message = runtime_error(r#"AppendFile("/tmp/x", [1, 300])"#);
    assert_eq!(message, "AppendFile() argument 2 must be bytes, got array containing 300");

    let message = runtime_error(r#"Exec("ls", "-l")"#);
    assert_eq!(message, "Exec() argument 2 must be array of strings, got string");
}

#[test]
fn test_builtins_cannot_be_reassigned() {
    let message = runtime_error(r#"MD5 = 1"#);
    assert_eq!(message, "cannot assign to immutable binding 'MD5'");
    assert_eq!(run(r#"type(MD5)"#).unwrap(), HostValue::from("function"));
}

#[test]
fn test_restricted_library() {
    let library = BuiltinLibrary::standard().subset(&["MD5"]);
    let mut runtime = Runtime::new();
    runtime.register_builtins(&library).unwrap();

    assert!(runtime.eval(r#"MD5("x")"#).is_ok());
    let err = runtime.eval(r#"Exec("ls", [])"#).unwrap_err();
    assert!(err.to_string().contains("undefined variable 'Exec'"));
}

#[test]
fn test_append_twice_accumulates_and_delete_twice_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.txt");

    let source = format!(
        r#"
        let p = {p}
        [AppendFile(p, "one "), AppendFile(p, "two"), DeleteFile(p), DeleteFile(p)]
        "#,
        p = lit(&path)
    );
    assert_eq!(
        run(&source).unwrap(),
        HostValue::List(vec![
            HostValue::Bool(true),
            HostValue::Bool(true),
            HostValue::Bool(true),
            HostValue::Bool(false),
        ])
    );
    assert!(!path.exists());
}

#[test]
fn test_retrieved_bytes_write_back_exactly() {
    let url = serve_once("200 OK", "<html>remote</html>");
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.html");

    let source = format!(
        r#"WriteFile({p}, RetrieveFileFromURL("{url}/index.html"))"#,
        p = lit(&path),
        url = url
    );
    assert_eq!(run(&source).unwrap(), HostValue::Bool(true));
    assert_eq!(fs::read(&path).unwrap(), b"<html>remote</html>");
}

#[test]
fn test_timestamp_is_bounded_by_wall_clock() {
    let now = || {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    };
    let before = now();
    let stamp = run("Timestamp()").unwrap().to_integer().unwrap() as u64;
    let after = now();
    assert!(before <= stamp && stamp <= after, "{} <= {} <= {}", before, stamp, after);
}

#[test]
fn test_copy_file_onto_itself_keeps_contents() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("same.txt");
    fs::write(&path, "payload").unwrap();

    let source = format!("CopyFile({p}, {p})", p = lit(&path));
    assert_eq!(run(&source).unwrap(), HostValue::Bool(true));
    assert_eq!(fs::read_to_string(&path).unwrap(), "payload");
}

#[test]
fn test_replace_in_binary_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shadow.bin");
    fs::write(&path, b"\xff\xfeuser=root\x00").unwrap();

    let source = format!(r#"ReplaceInFile({}, "root", "lol")"#, lit(&path));
    assert_eq!(run(&source).unwrap(), HostValue::Bool(true));
    assert_eq!(fs::read(&path).unwrap(), b"\xff\xfeuser=lol\x00");
}

#[test]
fn test_builtins_cannot_be_redeclared() {
    assert_eq!(runtime_error("var MD5 = 1"), "cannot assign to immutable binding 'MD5'");

    let mut runtime = Runtime::new();
    runtime.register_builtins(&BuiltinLibrary::standard()).unwrap();
    assert!(runtime.eval(r#"let Exec = "hijacked""#).is_err());
    assert_eq!(runtime.get("Exec").unwrap().value, HostValue::Function("Exec".to_string()));
    assert!(runtime.exports().is_empty());
}
