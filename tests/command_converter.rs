#![cfg(unix)]

use morph_check::{
    config::ConverterDef,
    converter::{CommandConverter, ConvertRequest, Converter},
    error::ConvertError,
    format::Format,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

fn sh(script: &str) -> CommandConverter {
    let def = ConverterDef {
        program: "sh".into(),
        args: vec!["-c".into(), script.into(), "sh".into()],
        env: BTreeMap::new(),
    };
    CommandConverter::new("sh", &def)
}

fn request<'a>(
    source: &'a Path,
    out_dir: &'a Path,
    options: &'a BTreeMap<String, String>,
    timeout: Option<Duration>,
) -> ConvertRequest<'a> {
    ConvertRequest {
        source,
        source_format: Format::Markdown,
        target_format: Format::Html,
        options,
        out_dir,
        output: out_dir.join("doc.html"),
        timeout,
    }
}

#[test]
fn placeholders_are_rendered() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("doc.md");
    std::fs::write(&source, "# Hi\n").unwrap();
    let def = ConverterDef {
        program: "sh".into(),
        args: vec![
            "-c".into(),
            r#"printf '%s %s %s' "$1" "$2" "$3" > "$0""#.into(),
            "{output}".into(),
            "{target}".into(),
            "{opt:theme=light}".into(),
            "{stem}".into(),
        ],
        env: BTreeMap::new(),
    };
    let converter = CommandConverter::new("sh", &def);
    let options = BTreeMap::new();

    let out = converter
        .convert(&request(&source, dir.path(), &options, None))
        .unwrap();
    assert_eq!(std::fs::read_to_string(&out.path).unwrap(), "html light doc");
}

#[test]
fn missing_option_drops_the_argument() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("doc.md");
    std::fs::write(&source, "# Hi\n").unwrap();
    let def = ConverterDef {
        program: "sh".into(),
        args: vec![
            "-c".into(),
            r#"printf '%s' "$#" > "$0""#.into(),
            "{output}".into(),
            "--css={opt:css}".into(),
            "{opt:toc=}".into(),
        ],
        env: BTreeMap::new(),
    };
    let converter = CommandConverter::new("sh", &def);

    let none = BTreeMap::new();
    let out = converter
        .convert(&request(&source, dir.path(), &none, None))
        .unwrap();
    assert_eq!(std::fs::read_to_string(&out.path).unwrap(), "1");

    let with_css = BTreeMap::from([("css".to_string(), "print.css".to_string())]);
    let out = converter
        .convert(&request(&source, dir.path(), &with_css, None))
        .unwrap();
    assert_eq!(std::fs::read_to_string(&out.path).unwrap(), "2");
}

#[test]
fn stderr_warnings_are_collected() {
    let dir = tempfile::tempdir().unwrap();
    let options = BTreeMap::new();
    let converter = sh(&format!(
        "echo 'Warning: missing font' >&2; echo progress >&2; echo ok > '{}'",
        dir.path().join("doc.html").display()
    ));

    let out = converter
        .convert(&request(Path::new("doc.md"), dir.path(), &options, None))
        .unwrap();
    assert_eq!(out.warnings, ["Warning: missing font"]);
}

#[test]
fn non_zero_exit_fails_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let options = BTreeMap::new();
    let converter = sh(&format!(
        "echo partial > '{}'; echo boom >&2; exit 3",
        dir.path().join("doc.html").display()
    ));

    let err = converter
        .convert(&request(Path::new("doc.md"), dir.path(), &options, None))
        .unwrap_err();
    assert!(matches!(&err, ConvertError::Failed(msg) if msg.contains("boom")));
    assert!(!dir.path().join("doc.html").exists());
}

#[test]
fn tool_named_output_is_adopted() {
    let dir = tempfile::tempdir().unwrap();
    let options = BTreeMap::new();
    let converter = sh(&format!(
        "echo '<html></html>' > '{}'",
        dir.path().join("notes.html").display()
    ));
    let mut req = request(Path::new("notes.md"), dir.path(), &options, None);
    req.output = dir.path().join("notes.pandoc.html");

    let out = converter.convert(&req).unwrap();
    assert_eq!(out.path, dir.path().join("notes.pandoc.html"));
    assert!(out.path.exists());
    assert!(!dir.path().join("notes.html").exists());
}

#[test]
fn success_without_output_is_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let options = BTreeMap::new();
    let err = sh("exit 0")
        .convert(&request(Path::new("doc.md"), dir.path(), &options, None))
        .unwrap_err();
    assert!(matches!(err, ConvertError::Failed(_)));
}

#[test]
fn timeout_kills_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let options = BTreeMap::new();
    let started = Instant::now();
    let err = sh("sleep 5")
        .convert(&request(
            Path::new("doc.md"),
            dir.path(),
            &options,
            Some(Duration::from_millis(100)),
        ))
        .unwrap_err();
    assert_eq!(err, ConvertError::Timeout);
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[test]
fn timeout_kills_helpers_the_tool_spawned() {
    let dir = tempfile::tempdir().unwrap();
    let options = BTreeMap::new();
    let marker = dir.path().join("late.txt");
    let converter = sh(&format!(
        "(sleep 1; echo late > '{}') & wait",
        marker.display()
    ));

    let err = converter
        .convert(&request(
            Path::new("doc.md"),
            dir.path(),
            &options,
            Some(Duration::from_millis(100)),
        ))
        .unwrap_err();
    assert_eq!(err, ConvertError::Timeout);

    std::thread::sleep(Duration::from_millis(1500));
    assert!(!marker.exists());
}

#[test]
fn non_executable_program_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let script = plain_script(dir.path());
    let def = ConverterDef {
        program: script.display().to_string(),
        args: Vec::new(),
        env: BTreeMap::new(),
    };
    let converter = CommandConverter::new("plain-file", &def);
    assert!(converter.locate().is_none());

    let options = BTreeMap::new();
    let err = converter
        .convert(&request(Path::new("doc.md"), dir.path(), &options, None))
        .unwrap_err();
    assert!(matches!(err, ConvertError::Unavailable(_)));
}

/// A shell script without the executable bit.
fn plain_script(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("convert.sh");
    std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
    path
}

#[test]
fn missing_program_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let options = BTreeMap::new();
    let def = ConverterDef {
        program: "definitely-not-a-real-converter-binary".into(),
        args: Vec::new(),
        env: BTreeMap::new(),
    };
    let converter = CommandConverter::new("ghost", &def);
    assert!(converter.locate().is_none());
    assert!(sh("exit 0").locate().is_some());

    let err = converter
        .convert(&request(Path::new("doc.md"), dir.path(), &options, None))
        .unwrap_err();
    assert!(matches!(err, ConvertError::Unavailable(_)));
    assert_eq!(converter.name(), "ghost");
}
