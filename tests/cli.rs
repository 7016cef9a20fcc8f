use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use git2::Repository;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

const NOTEBOOK: &str = r##"{
  "nbformat": 4,
  "nbformat_minor": 5,
  "metadata": {"kernelspec": {"name": "python3", "display_name": "Python 3"}},
  "cells": [
    {
      "cell_type": "code",
      "id": "a1",
      "execution_count": 7,
      "metadata": {},
      "outputs": [{"output_type": "stream", "name": "stdout", "text": ["2\n"]}],
      "source": ["print(1 + 1)"]
    },
    {
      "cell_type": "markdown",
      "id": "b2",
      "metadata": {},
      "source": ["# Notes"]
    }
  ]
}
"##;

fn nbclean(dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_nbclean"));
    cmd.current_dir(dir)
        .env("NBCLEAN_CONFIG", dir.join("no-such-config.json"))
        .env_remove("NBCLEAN_LOG");
    cmd
}

fn with_stdin(cmd: &mut Command, input: &[u8]) -> Output {
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn nbclean");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(input)
        .expect("write stdin");
    child.wait_with_output().expect("wait for nbclean")
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "nbclean failed: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn assert_stripped(bytes: &[u8]) {
    let doc: Value = serde_json::from_slice(bytes).expect("cleaned output is JSON");
    assert_eq!(doc["cells"][0]["outputs"], json!([]));
    assert_eq!(doc["cells"][0]["execution_count"], Value::Null);
    assert_eq!(doc["cells"][0]["source"], json!(["print(1 + 1)"]));
    assert_eq!(doc["cells"][1]["source"], json!(["# Notes"]));
    assert_eq!(doc["metadata"]["kernelspec"]["name"], "python3");
}

#[test]
fn clean_reads_stdin_and_writes_stdout() {
    let tmp = tempfile::tempdir().expect("create temp dir");

    let output = with_stdin(nbclean(tmp.path()).arg("clean"), NOTEBOOK.as_bytes());
    assert_success(&output);
    assert_stripped(&output.stdout);
    let text = String::from_utf8(output.stdout).expect("utf-8");
    assert!(text.starts_with("{\n \"cells\": ["), "got: {text}");
    assert!(text.ends_with("}\n"));

    let mut jq = nbclean(tmp.path());
    jq.args(["clean", "--style", "jq"]);
    let output = with_stdin(&mut jq, NOTEBOOK.as_bytes());
    assert_success(&output);
    assert_stripped(&output.stdout);
    let text = String::from_utf8(output.stdout).expect("utf-8");
    assert!(text.starts_with("{\n  \"nbformat\": 4,"), "got: {text}");
}

#[test]
fn malformed_input_passes_through_unless_asked_to_fail() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    let garbage = b"this is not { a notebook";

    let output = with_stdin(nbclean(tmp.path()).arg("clean"), garbage);
    assert_success(&output);
    assert_eq!(output.stdout, garbage);

    let mut strict = nbclean(tmp.path());
    strict.args(["clean", "--on-error", "fail"]);
    let output = with_stdin(&mut strict, garbage);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn smudge_is_identity() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    let output = with_stdin(nbclean(tmp.path()).arg("smudge"), NOTEBOOK.as_bytes());
    assert_success(&output);
    assert_eq!(output.stdout, NOTEBOOK.as_bytes());
}

#[test]
fn check_exit_status_reflects_dirty_notebooks() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    std::fs::write(tmp.path().join("run.ipynb"), NOTEBOOK).expect("write notebook");

    let output = nbclean(tmp.path()).arg("check").output().expect("run check");
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stdout).contains("run.ipynb"));

    let cleaned = with_stdin(nbclean(tmp.path()).arg("clean"), NOTEBOOK.as_bytes());
    std::fs::write(tmp.path().join("run.ipynb"), cleaned.stdout).expect("rewrite notebook");
    let output = nbclean(tmp.path()).arg("check").output().expect("run check");
    assert_success(&output);
}

fn staged_roundtrip(install_args: &[&str]) {
    let tmp = tempfile::tempdir().expect("create temp dir");
    Repository::init(tmp.path()).expect("init repo");
    std::fs::write(tmp.path().join("run.ipynb"), NOTEBOOK).expect("write notebook");
    std::fs::write(tmp.path().join("notes.txt"), "plain text\n").expect("write text");

    let output = nbclean(tmp.path())
        .arg("install")
        .args(install_args)
        .output()
        .expect("run install");
    assert_success(&output);
    assert_eq!(
        std::fs::read_to_string(tmp.path().join(".gitattributes")).expect("attributes"),
        "*.ipynb filter=strip-notebook-output\n"
    );

    let output = nbclean(tmp.path())
        .args(["stage", "run.ipynb", "notes.txt"])
        .output()
        .expect("run stage");
    assert_success(&output);

    let staged = nbclean(tmp.path())
        .args(["staged", "run.ipynb"])
        .output()
        .expect("run staged");
    assert_success(&staged);
    assert_stripped(&staged.stdout);

    let notes = nbclean(tmp.path())
        .args(["staged", "notes.txt"])
        .output()
        .expect("run staged");
    assert_eq!(notes.stdout, b"plain text\n");

    assert_eq!(
        std::fs::read_to_string(tmp.path().join("run.ipynb")).expect("working copy"),
        NOTEBOOK
    );
}

#[test]
fn install_then_stage_strips_index_copy() {
    staged_roundtrip(&[]);
}

#[test]
fn install_then_stage_through_process_protocol() {
    staged_roundtrip(&["--process"]);
}

#[test]
fn missing_filter_program_stages_original() {
    let tmp = tempfile::tempdir().expect("create temp dir");
    let repo = Repository::init(tmp.path()).expect("init repo");
    repo.config()
        .expect("config")
        .set_str("filter.strip.clean", "/nonexistent/nbclean clean")
        .expect("set clean");
    std::fs::write(tmp.path().join(".gitattributes"), "*.ipynb filter=strip\n")
        .expect("write attributes");
    std::fs::write(tmp.path().join("run.ipynb"), NOTEBOOK).expect("write notebook");

    let output = nbclean(tmp.path())
        .args(["stage", "run.ipynb"])
        .output()
        .expect("run stage");
    assert_success(&output);

    let staged = nbclean(tmp.path())
        .args(["staged", "run.ipynb"])
        .output()
        .expect("run staged");
    assert_eq!(staged.stdout, NOTEBOOK.as_bytes());
}
