use clap::{Parser, Subcommand, ValueEnum};
use cmdspec::{Suite, SuiteBuilder, TestResult, find_documents, schema};
use log::{LevelFilter, Metadata, Record};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    /// Human-readable output with checkmarks
    #[default]
    Human,
    /// Machine-readable JSON output
    Json,
    /// JUnit XML output for CI systems
    Junit,
}

#[derive(Parser)]
#[command(name = "cmdspec")]
#[command(about = "Run declarative test documents against command-line tools")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run test documents
    Run {
        /// Path to test documents (file or directory)
        path: PathBuf,
        /// Output format
        #[arg(short, long, default_value = "human")]
        output: OutputFormat,
        /// Filter tests by name pattern (substring match)
        #[arg(short, long)]
        filter: Option<String>,
        /// Log step execution and spawned commands to stderr
        #[arg(short, long)]
        verbose: bool,
        /// Run documents and their tests one at a time
        #[arg(long)]
        serial: bool,
    },
    /// Load test documents without running them
    Validate {
        /// Path to test documents (file or directory)
        path: PathBuf,
    },
    /// Scaffold a new test document
    Init {
        /// Output path for the new document
        #[arg(default_value = "tests/example.yaml")]
        path: PathBuf,
    },
    /// Output the document schema
    Schema,
}

/// Writes log records to stderr.
struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging(verbose: bool) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        });
    }
}

const EXAMPLE_DOCUMENT: &str = r#"config:
  vars:
    greeting: hello
    # sh: {type: executable, executable: sh}
  # coverage:
  #   enabled: true

pre_run_definitions:
  scratch:
    - type: command
      command: mkdtemp
      register:
        - {name: dir, attribute: path}

cases:
  - name: example
    setup: [scratch]
    tests:
      - name: greet
        cmd: echo ${greeting} world
        status: 0
        output: hello world
      - name: create_file
        cmd: touch ${dir}/out.txt
        assertions:
          - {type: file, path: "${dir}/out.txt"}
    scenarios:
      - name: write_then_read
        steps:
          - {name: write, cmd: "echo data > ${dir}/data", status: 0}
          - {name: read, cmd: "cat ${dir}/data", output: data}
"#;

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            path,
            output,
            filter,
            verbose,
            serial,
        } => {
            init_logging(verbose);
            run(&path, output, filter.as_deref(), serial)
        }
        Command::Validate { path } => {
            init_logging(false);
            validate(&path)
        }
        Command::Init { path } => init(&path),
        Command::Schema => match serde_json::to_string_pretty(&schema::generate_schema()) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error serializing schema: {e}");
                ExitCode::FAILURE
            }
        },
    }
}

/// Load, reset coverage if asked, then run one document.
fn run_document(path: &Path, filter: Option<&str>, parallel: bool) -> Result<Vec<TestResult>, String> {
    let suite: Suite = SuiteBuilder::default()
        .load(path)
        .map_err(|e| e.to_string())?;
    if suite.config.coverage.enabled && suite.config.coverage.reset {
        suite
            .config
            .coverage
            .erase()
            .map_err(|e| format!("coverage reset failed: {e}"))?;
    }
    Ok(suite.run(filter, parallel))
}

fn run(path: &Path, output: OutputFormat, filter: Option<&str>, serial: bool) -> ExitCode {
    let documents = match find_documents(path) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Error finding documents: {e}");
            return ExitCode::FAILURE;
        }
    };
    if documents.is_empty() {
        eprintln!("No test documents found at: {}", path.display());
        return ExitCode::FAILURE;
    }

    let run_start = Instant::now();
    let file_results: Vec<(PathBuf, Result<Vec<TestResult>, String>)> = if serial {
        documents
            .iter()
            .map(|p| (p.clone(), run_document(p, filter, false)))
            .collect()
    } else {
        thread::scope(|s| {
            let handles: Vec<_> = documents
                .iter()
                .map(|p| (p, s.spawn(move || run_document(p, filter, true))))
                .collect();

            handles
                .into_iter()
                .map(|(p, h)| {
                    let result = h
                        .join()
                        .unwrap_or_else(|_| Err("document thread panicked".to_string()));
                    (p.clone(), result)
                })
                .collect()
        })
    };

    let mut json_results = Vec::new();
    let mut junit_results = Vec::new();
    let mut total_passed = 0;
    let mut total_failed = 0;

    for (document, result) in file_results {
        let tests = match result {
            Ok(tests) => tests,
            Err(e) => {
                total_failed += 1;
                match output {
                    OutputFormat::Human => {
                        eprintln!("✗ Failed to load {}: {e}", document.display());
                    }
                    OutputFormat::Json => json_results.push(serde_json::json!({
                        "file": document.display().to_string(),
                        "error": e,
                    })),
                    OutputFormat::Junit => junit_results.push(JunitFileResult {
                        file: document.display().to_string(),
                        tests: vec![TestResult {
                            name: "<load>".to_string(),
                            passed: false,
                            duration: Duration::ZERO,
                            checks: Vec::new(),
                            errors: vec![format!("Failed to load document: {e}")],
                        }],
                        total_time: Duration::ZERO,
                    }),
                }
                continue;
            }
        };

        let passed = tests.iter().filter(|t| t.passed).count();
        total_passed += passed;
        total_failed += tests.len() - passed;

        match output {
            OutputFormat::Human => {
                println!("\n{}", document.display());
                for test in &tests {
                    if test.passed {
                        println!("  ✓ {} ({:.2?})", test.name, test.duration);
                    } else {
                        println!("  ✗ {} ({:.2?})", test.name, test.duration);
                        for failure in test.failures() {
                            println!("    {failure}");
                        }
                    }
                }
            }
            OutputFormat::Json => json_results.push(serde_json::json!({
                "file": document.display().to_string(),
                "tests": tests,
            })),
            OutputFormat::Junit => junit_results.push(JunitFileResult {
                file: document.display().to_string(),
                total_time: tests.iter().map(|t| t.duration).sum(),
                tests,
            }),
        }
    }

    match output {
        OutputFormat::Human => println!("\n{total_passed} passed, {total_failed} failed"),
        OutputFormat::Json => {
            let report = serde_json::json!({
                "passed": total_passed,
                "failed": total_failed,
                "results": json_results,
            });
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("Error serializing results: {e}");
                    return ExitCode::FAILURE;
                }
            }
        }
        OutputFormat::Junit => print!("{}", format_junit_xml(&junit_results, run_start.elapsed())),
    }

    if total_failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn validate(path: &Path) -> ExitCode {
    let documents = match find_documents(path) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Error finding documents: {e}");
            return ExitCode::FAILURE;
        }
    };
    if documents.is_empty() {
        eprintln!("No test documents found at: {}", path.display());
        return ExitCode::FAILURE;
    }

    let builder = SuiteBuilder::default();
    let mut errors = 0;
    for document in &documents {
        match builder.load(document) {
            Ok(suite) => {
                println!(
                    "✓ {} ({} tests)",
                    document.display(),
                    suite.runnables().count()
                );
            }
            Err(e) => {
                eprintln!("✗ {}: {e}", document.display());
                errors += 1;
            }
        }
    }

    if errors > 0 {
        eprintln!("\n{errors} document(s) failed validation");
        return ExitCode::FAILURE;
    }
    println!("\nAll {} document(s) valid", documents.len());
    ExitCode::SUCCESS
}

fn init(path: &Path) -> ExitCode {
    if path.exists() {
        eprintln!("Error: file already exists: {}", path.display());
        return ExitCode::FAILURE;
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
        && let Err(e) = fs::create_dir_all(parent)
    {
        eprintln!("Error creating directory: {e}");
        return ExitCode::FAILURE;
    }
    if let Err(e) = fs::write(path, EXAMPLE_DOCUMENT) {
        eprintln!("Error writing file: {e}");
        return ExitCode::FAILURE;
    }
    println!("Created: {}", path.display());
    ExitCode::SUCCESS
}

/// A file result for JUnit output.
struct JunitFileResult {
    file: String,
    tests: Vec<TestResult>,
    total_time: Duration,
}

/// Format test results as JUnit XML.
fn format_junit_xml(results: &[JunitFileResult], total_time: Duration) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");

    let total_tests: usize = results.iter().map(|r| r.tests.len()).sum();
    let total_failures = results
        .iter()
        .flat_map(|r| &r.tests)
        .filter(|t| !t.passed)
        .count();

    let _ = writeln!(
        xml,
        "<testsuites tests=\"{total_tests}\" failures=\"{total_failures}\" time=\"{:.3}\">",
        total_time.as_secs_f64()
    );

    for file_result in results {
        let tests = file_result.tests.len();
        let failures = file_result.tests.iter().filter(|t| !t.passed).count();
        let _ = writeln!(
            xml,
            "  <testsuite name=\"{}\" tests=\"{tests}\" failures=\"{failures}\" time=\"{:.3}\">",
            escape_xml(&file_result.file),
            file_result.total_time.as_secs_f64()
        );

        for test in &file_result.tests {
            let _ = writeln!(
                xml,
                "    <testcase name=\"{}\" time=\"{:.3}\">",
                escape_xml(&test.name),
                test.duration.as_secs_f64()
            );
            if !test.passed {
                let failures = test.failures();
                let message = failures.first().map(String::as_str).unwrap_or("Test failed");
                let _ = writeln!(xml, "      <failure message=\"{}\">", escape_xml(message));
                for failure in &failures {
                    let _ = writeln!(xml, "{}", escape_xml(failure));
                }
                xml.push_str("      </failure>\n");
            }
            xml.push_str("    </testcase>\n");
        }

        xml.push_str("  </testsuite>\n");
    }

    xml.push_str("</testsuites>\n");
    xml
}

/// Escape special XML characters.
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, passed: bool, errors: &[&str]) -> TestResult {
        TestResult {
            name: name.to_string(),
            passed,
            duration: Duration::from_millis(250),
            checks: Vec::new(),
            errors: errors.iter().map(|e| e.to_string()).collect(),
        }
    }

    #[test]
    fn escape_xml_special_characters() {
        assert_eq!(escape_xml("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&apos;");
    }

    #[test]
    fn junit_reports_failures() {
        let results = vec![JunitFileResult {
            file: "doc.yaml".to_string(),
            tests: vec![
                result("case:ok", true, &[]),
                result("case:bad", false, &["Setup failed: <boom>"]),
            ],
            total_time: Duration::from_millis(500),
        }];
        let xml = format_junit_xml(&results, Duration::from_secs(1));

        assert!(xml.contains("<testsuites tests=\"2\" failures=\"1\" time=\"1.000\">"));
        assert!(xml.contains("<testcase name=\"case:ok\" time=\"0.250\">"));
        assert!(xml.contains("<failure message=\"Setup failed: &lt;boom&gt;\">"));
    }

    #[test]
    fn example_document_parses() {
        let document: schema::Document = serde_yaml::from_str(EXAMPLE_DOCUMENT).unwrap();
        assert_eq!(document.cases[0].tests.len(), 2);
        assert_eq!(document.cases[0].scenarios.len(), 1);
    }
}
