use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use replcheck_core::write_text_atomic;
use replcheck_report::{render_json_report, render_report, ExecutionResult};
use replcheck_runtime::{
    clojure_test_submission, connect_session, evaluate, load_runner_config, run_orchestrated,
    run_submissions, RunError, RunnerConfig, ShadowCljsForms,
};
use replcheck_transport::{DoneMatching, Session};

use crate::cli_args::{Cli, CliCommand, CliReportFormat};
use crate::port_file::discover_port;

pub(crate) const MAX_TEST_EXIT_STATUS: u8 = 100;
pub(crate) const INVOCATION_ERROR_EXIT_STATUS: u8 = 101;

/// Config file values with command-line overrides applied.
pub(crate) fn resolve_runner_config(cli: &Cli, cwd: &Path) -> Result<(RunnerConfig, u16)> {
    let config_path = if cli.config.is_absolute() {
        cli.config.clone()
    } else {
        cwd.join(&cli.config)
    };
    let mut config = load_runner_config(&config_path)?;
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if cli.legacy_done {
        config.done_matching = DoneMatching::Legacy;
    }
    let port = match cli.port.or(config.port) {
        Some(port) => port,
        None => discover_port(cwd, cli.port_file.as_deref())?.with_context(|| {
            format!(
                "no nREPL port: pass --port, set it in {}, or start a server that writes .nrepl-port",
                config_path.display()
            )
        })?,
    };
    config.port = Some(port);
    config.validate()?;
    Ok((config, port))
}

pub(crate) fn test_exit_status(result: &ExecutionResult) -> u8 {
    let failed = result.exit_status().min(u64::from(MAX_TEST_EXIT_STATUS));
    u8::try_from(failed).unwrap_or(MAX_TEST_EXIT_STATUS)
}

async fn finish_session<T>(session: Session, outcome: Result<T, RunError>) -> Result<T, RunError> {
    if let Err(error) = session.close().await {
        tracing::debug!(%error, "session close failed");
    }
    outcome
}

fn emit_report(cli: &Cli, config: &RunnerConfig, result: &ExecutionResult) -> Result<u8> {
    let rendered = match cli.format {
        CliReportFormat::Text => render_report(result, &config.normalizer),
        CliReportFormat::Json => {
            let mut json = render_json_report(result).context("failed to render JSON report")?;
            json.push('\n');
            json
        }
    };
    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(rendered.as_bytes())
        .context("failed to write report to stdout")?;
    stdout.flush().context("failed to flush stdout")?;
    if let Some(path) = &cli.report_file {
        write_text_atomic(path, &rendered)
            .with_context(|| format!("failed to write report file {}", path.display()))?;
    }
    Ok(test_exit_status(result))
}

pub(crate) async fn run_cli(cli: Cli, cwd: &Path) -> Result<u8> {
    let (config, port) = resolve_runner_config(&cli, cwd)?;
    tracing::debug!(host = config.host.as_str(), port, "resolved runner config");
    let mut session = connect_session(&config.host, port, &config)
        .await
        .with_context(|| format!("failed to open session on {}:{port}", config.host))?;

    match &cli.command {
        CliCommand::Test { units } => {
            let submissions = units
                .iter()
                .map(|unit| clojure_test_submission(unit))
                .collect::<Vec<_>>();
            let outcome = run_submissions(&mut session, &submissions, config.call_timeout()).await;
            let result = finish_session(session, outcome).await?;
            emit_report(&cli, &config, &result)
        }
        CliCommand::CljsTest { build, units } => {
            let outcome =
                run_orchestrated(&mut session, &ShadowCljsForms, build, units, &config).await;
            let result = finish_session(session, outcome).await?;
            emit_report(&cli, &config, &result)
        }
        CliCommand::Eval { code } => {
            let outcome = evaluate(&mut session, code, config.call_timeout()).await;
            let evaluation = finish_session(session, outcome).await?;
            print!("{}", evaluation.capture.stdout);
            eprint!("{}", evaluation.capture.stderr);
            if let Some(value) = &evaluation.value {
                println!("{value}");
            }
            Ok(0)
        }
    }
}

/// Prints an invocation failure and whatever it captured to stderr.
pub(crate) fn report_failure(error: &anyhow::Error) {
    eprintln!("error: {error:#}");
    let Some(run_error) = error.downcast_ref::<RunError>() else {
        return;
    };
    let capture = run_error.capture();
    if capture.is_empty() {
        return;
    }
    eprintln!(
        "partial capture ({} frames received):",
        capture.frames.len()
    );
    if !capture.stdout.is_empty() {
        eprintln!("--- stdout ---\n{}", capture.stdout.trim_end());
    }
    if !capture.stderr.is_empty() {
        eprintln!("--- stderr ---\n{}", capture.stderr.trim_end());
    }
}
