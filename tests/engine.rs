//! End-to-end tests of documents loaded and run through the library.

use cmdspec::{CheckOutcome, Error, Runnable, TestResult, load_suite};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn document(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("doc.yaml");
    fs::write(&path, contents).unwrap();
    path
}

fn run_all(path: &Path) -> Vec<TestResult> {
    load_suite(path).unwrap().run(None, false)
}

#[test]
fn status_and_output_are_checked_independently() {
    let dir = TempDir::new().unwrap();
    let path = document(
        dir.path(),
        r#"
config:
  vars:
    msg: hi
cases:
  - name: echo
    tests:
      - {name: ok, cmd: "echo ${msg}", status: 0, output: hi}
      - {name: wrong_status, cmd: "echo ${msg}", status: 1, output: hi}
"#,
    );

    let results = run_all(&path);
    assert!(results[0].passed, "{:?}", results[0].failures());

    let wrong = &results[1];
    assert!(!wrong.passed);
    assert!(matches!(wrong.checks[0].outcome, CheckOutcome::Failed(_)));
    assert_eq!(wrong.checks[1].outcome, CheckOutcome::Passed);
}

#[test]
fn temp_directory_is_shared_with_command_and_removed() {
    let dir = TempDir::new().unwrap();
    let record = dir.path().join("seen");
    let path = document(
        dir.path(),
        &format!(
            r#"
pre_run_definitions:
  scratch:
    - type: command
      command: mkdtemp
      register: [{{name: dir, attribute: path}}]
cases:
  - name: files
    setup: [scratch]
    tests:
      - name: touch
        cmd: "touch ${{dir}}/made && printf %s ${{dir}} > {record}"
        status: 0
        assertions:
          - {{type: file, path: "${{dir}}/made"}}
"#,
            record = record.display()
        ),
    );

    let results = run_all(&path);
    assert!(results[0].passed, "{:?}", results[0].failures());

    let created = PathBuf::from(fs::read_to_string(&record).unwrap());
    assert!(!created.exists(), "{} was not cleaned up", created.display());
}

#[test]
fn scenario_steps_share_state() {
    let dir = TempDir::new().unwrap();
    let path = document(
        dir.path(),
        r#"
pre_run_definitions:
  scratch:
    - type: command
      command: mkdtemp
      register: [{name: dir, attribute: path}]
cases:
  - name: flow
    setup: [scratch]
    scenarios:
      - name: write_then_read
        steps:
          - {name: write, cmd: "echo payload > ${dir}/data", status: 0}
          - {name: read, cmd: "cat ${dir}/data", output: payload}
          - name: relative
            cmd: "true"
            cwd: "${dir}"
            assertions:
              - {type: file, path: data}
"#,
    );

    let results = run_all(&path);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].name, "flow:write_then_read");
    assert!(results[0].passed, "{:?}", results[0].failures());
    assert_eq!(results[0].checks.len(), 3);
}

#[test]
fn write_file_renders_template_and_restores_target() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("greeting.tpl"), "hello ${who}\n").unwrap();
    let target = dir.path().join("out.txt");
    fs::write(&target, "original").unwrap();

    let path = document(
        dir.path(),
        &format!(
            r#"
config:
  vars:
    who: world
pre_run_definitions:
  render:
    - type: command
      command: write_file
      source: {{file: greeting.tpl}}
      target: {target}
      register: [{{name: rendered, attribute: path}}]
cases:
  - name: write
    setup: [render]
    tests:
      - {{name: read, cmd: "cat ${{rendered}}", output: hello world}}
"#,
            target = target.display()
        ),
    );

    let results = run_all(&path);
    assert!(results[0].passed, "{:?}", results[0].failures());
    assert_eq!(fs::read_to_string(&target).unwrap(), "original");
}

#[test]
fn variables_resolve_in_any_order() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("version.txt"), "1.2.3\n").unwrap();
    let path = document(
        dir.path(),
        r#"
config:
  vars:
    banner: {type: template, value: "${name} ${version}"}
    version: {type: file, path: version.txt}
    name: {type: command, command: "echo ${base}-cli"}
    base: tool
cases:
  - name: vars
    tests:
      - {name: banner, cmd: "echo ${banner}", output: tool-cli 1.2.3}
"#,
    );

    let suite = load_suite(&path).unwrap();
    assert_eq!(suite.config.variables.get("banner"), Some("tool-cli 1.2.3"));
    assert!(suite.run(None, false)[0].passed);
}

#[test]
fn circular_variables_fail_loading() {
    let dir = TempDir::new().unwrap();
    let path = document(
        dir.path(),
        "config:\n  vars:\n    a: {type: ref, of: b}\n    b: {type: ref, of: a}\ncases: []\n",
    );
    let err = load_suite(&path).unwrap_err();
    assert!(matches!(err, Error::VariableLoop(ref names) if names == &["a", "b"]));
}

#[test]
fn failing_setup_cleans_up_earlier_steps() {
    let dir = TempDir::new().unwrap();
    let record = dir.path().join("seen");
    let path = document(
        dir.path(),
        &format!(
            r#"
pre_run_definitions:
  broken:
    - type: command
      command: mkdtemp
      register: [{{name: dir, attribute: path}}]
    - type: command
      command: shell
      run: "printf %s ${{dir}} > {record}; exit 1"
cases:
  - name: setup
    setup: [broken]
    tests:
      - {{name: never, cmd: "true", status: 0}}
"#,
            record = record.display()
        ),
    );

    let results = run_all(&path);
    assert!(!results[0].passed);
    assert!(results[0].checks.is_empty());
    assert!(results[0].errors[0].starts_with("Setup failed"));

    let created = PathBuf::from(fs::read_to_string(&record).unwrap());
    assert!(!created.exists());
}

#[test]
fn teardown_definitions_run_after_each_test() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("log");
    let path = document(
        dir.path(),
        &format!(
            r#"
pre_run_definitions:
  note:
    - type: command
      command: shell
      run: "echo teardown >> {log}"
cases:
  - name: order
    teardown: [note]
    tests:
      - {{name: one, cmd: "echo one >> {log}"}}
      - {{name: two, cmd: "echo two >> {log}"}}
"#,
            log = log.display()
        ),
    );

    let results = run_all(&path);
    assert!(results.iter().all(|r| r.passed));
    assert_eq!(
        fs::read_to_string(&log).unwrap(),
        "one\nteardown\ntwo\nteardown\n"
    );
}

#[test]
fn every_runnable_gets_its_own_directory() {
    let dir = TempDir::new().unwrap();
    let path = document(
        dir.path(),
        r#"
pre_run_definitions:
  scratch:
    - type: command
      command: mkdtemp
      register: [{name: dir, attribute: path}]
cases:
  - name: isolation
    setup: [scratch]
    tests:
      - {name: a, cmd: "test ! -e ${dir}/marker && touch ${dir}/marker", status: 0}
      - {name: b, cmd: "test ! -e ${dir}/marker && touch ${dir}/marker", status: 0}
"#,
    );

    let suite = load_suite(&path).unwrap();
    assert_eq!(suite.runnables().filter(|r| matches!(r, Runnable::Test(_))).count(), 2);
    let results = suite.run(None, true);
    assert!(results.iter().all(|r| r.passed), "{results:?}");
}

#[test]
fn timed_out_command_still_removes_setup_resources() {
    let dir = TempDir::new().unwrap();
    let record = dir.path().join("seen");
    let path = document(
        dir.path(),
        &format!(
            r#"
pre_run_definitions:
  scratch:
    - type: command
      command: mkdtemp
      register: [{{name: dir, attribute: path}}]
cases:
  - name: slow
    setup: [scratch]
    tests:
      - name: hangs
        cmd: "printf %s ${{dir}} > {record}; sleep 5"
        timeout: 0.3
        status: 0
"#,
            record = record.display()
        ),
    );

    let results = run_all(&path);
    assert!(!results[0].passed);
    assert!(results[0].checks.is_empty());
    assert!(
        results[0].errors[0].starts_with("Command execution failed"),
        "{:?}",
        results[0].errors
    );
    assert!(results[0].errors[0].contains("timed out"), "{:?}", results[0].errors);

    let created = PathBuf::from(fs::read_to_string(&record).unwrap());
    assert!(created.is_absolute());
    assert!(!created.exists(), "{} was not cleaned up", created.display());
}

#[test]
fn scenario_directory_is_removed_after_last_step() {
    let dir = TempDir::new().unwrap();
    let record = dir.path().join("seen");
    let path = document(
        dir.path(),
        &format!(
            r#"
pre_run_definitions:
  scratch:
    - type: command
      command: mkdtemp
      register: [{{name: dir, attribute: path}}]
cases:
  - name: flow
    setup: [scratch]
    scenarios:
      - name: steps
        steps:
          - {{name: first, cmd: "touch ${{dir}}/a", status: 0}}
          - {{name: last, cmd: "test -e ${{dir}}/a && printf %s ${{dir}} > {record}", status: 0}}
"#,
            record = record.display()
        ),
    );

    let results = run_all(&path);
    assert!(results[0].passed, "{:?}", results[0].failures());

    let created = PathBuf::from(fs::read_to_string(&record).unwrap());
    assert!(!created.exists(), "{} was not cleaned up", created.display());
}
