//! Declarative command-line test documents.
//!
//! A document declares variables, reusable setup steps and cases of
//! commands with the assertions their outcome must satisfy. [`load_suite`]
//! turns a document into runnable tests; [`Suite::run`] executes them.

pub mod assertions;
pub mod config;
pub mod error;
pub mod exec;
pub mod loader;
pub mod runner;
pub mod schema;
pub mod scope;
pub mod state;
pub mod steps;
pub mod template;
pub mod vars;

pub use config::Config;
pub use error::{Error, TemplateError};
pub use loader::{SuiteBuilder, find_documents, load_document, load_suite};
pub use runner::{CheckOutcome, CheckResult, Runnable, Suite, TestResult};
pub use scope::Scope;
pub use state::ExecutionState;
