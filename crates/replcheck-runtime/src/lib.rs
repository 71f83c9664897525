//! Test execution against a connected evaluation session.
//!
//! [`run`] and [`run_submissions`] evaluate inline summaries synchronously;
//! [`Orchestrator`] starts a background run and polls a remote result slot.

mod config;
mod error;
pub mod forms;
mod orchestrator;
mod runner;

pub use config::{load_runner_config, RunnerConfig, RUNNER_CONFIG_SCHEMA_VERSION};
pub use error::{Capture, RunError};
pub use forms::{
    clojure_test_submission, parse_unit_name, EchoProbe, ExecutionForms, ResultCollector,
    ShadowCljsForms,
};
pub use orchestrator::{decode_poll_value, run_orchestrated, Orchestrator, OrchestratorTimings};
pub use runner::{connect_session, evaluate, run, run_submissions, Evaluation};
