//! Background test execution with result polling.
//!
//! One session runs six strictly sequential steps: select the target build,
//! install the result collector, reload each unit, start the run, poll the
//! collector slot, then drain output that trails the result.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use replcheck_core::{parse_edn, remaining_until, EdnValue};
use replcheck_report::{split_output_lines, ExecutionResult};
use replcheck_transport::{last_value, remote_failure, Frame, Session, TransportError};

use crate::config::RunnerConfig;
use crate::error::{Capture, RunError};
use crate::forms::{ExecutionForms, ResultCollector};

/// Deadlines for the orchestrated steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorTimings {
    pub call_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub drain_quiet: Duration,
    pub drain_max: Duration,
}

impl Default for OrchestratorTimings {
    fn default() -> Self {
        Self::from(&RunnerConfig::default())
    }
}

impl From<&RunnerConfig> for OrchestratorTimings {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            call_timeout: config.call_timeout(),
            poll_interval: config.poll_interval(),
            poll_timeout: config.poll_timeout(),
            drain_quiet: config.drain_quiet(),
            drain_max: config.drain_max(),
        }
    }
}

#[derive(Debug, Default)]
struct PollState {
    attempt: u32,
    last_raw: Option<String>,
}

/// Decodes a peeked slot value.
///
/// A value that reads as a string literal is read a second time; when that
/// second read fails the first-pass string is kept.
pub fn decode_poll_value(raw: &str) -> Option<EdnValue> {
    let first = parse_edn(raw).ok()?;
    let EdnValue::String(inner) = &first else {
        return Some(first);
    };
    match parse_edn(inner) {
        Ok(second) => Some(second),
        Err(error) => {
            tracing::debug!(%error, "second decode of poll value failed");
            Some(first)
        }
    }
}

fn is_empty_slot(value: &EdnValue) -> bool {
    match value {
        EdnValue::Nil => true,
        EdnValue::String(text) => text.trim().is_empty(),
        _ => false,
    }
}

/// Drives one orchestrated run over a borrowed session.
pub struct Orchestrator<'a, S, F> {
    session: &'a mut Session<S>,
    forms: &'a F,
    collector: ResultCollector,
    timings: OrchestratorTimings,
    capture: Capture,
}

impl<'a, S, F> Orchestrator<'a, S, F>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: ExecutionForms,
{
    pub fn new(session: &'a mut Session<S>, forms: &'a F, timings: OrchestratorTimings) -> Self {
        let collector = forms
            .namespace()
            .map(ResultCollector::new)
            .unwrap_or_default();
        Self {
            session,
            forms,
            collector,
            timings,
            capture: Capture::default(),
        }
    }

    /// Runs all six steps and returns the collected result.
    ///
    /// Stdout and stderr hold everything printed across the steps, including
    /// frames that arrived outside any call.
    #[tracing::instrument(level = "debug", skip_all, fields(target_env = target, units = units.len()))]
    pub async fn run(mut self, target: &str, units: &[String]) -> Result<ExecutionResult, RunError> {
        let forms = self.forms;
        tracing::info!(target_env = target, "selecting target");
        self.select_target(target).await?;

        tracing::info!(slot = self.collector.slot_symbol().as_str(), "installing result collector");
        let install = forms.install_collector(&self.collector);
        let frames = self.step_call(&install, forms.namespace()).await?;
        if let Err(detail) = Self::expect_ack(&frames, forms.installed_ack()) {
            return Err(RunError::CollectorInstall {
                detail,
                capture: self.take_capture(),
            });
        }

        for unit in units {
            tracing::info!(unit = unit.as_str(), "reloading unit");
            let code = forms.reload_unit(unit);
            let frames = self.step_call(&code, forms.namespace()).await?;
            if let Err(detail) = Self::expect_ack(&frames, forms.reloaded_ack()) {
                return Err(RunError::Reload {
                    unit: unit.clone(),
                    detail,
                    capture: self.take_capture(),
                });
            }
        }

        tracing::info!("starting execution");
        let start = forms.start_execution(units);
        let frames = self.step_call(&start, forms.namespace()).await?;
        if let Err(detail) = Self::expect_ack(&frames, forms.pending_ack()) {
            return Err(RunError::Start {
                detail,
                capture: self.take_capture(),
            });
        }

        tracing::info!("polling for result");
        let slot = self.poll_for_result().await?;

        tracing::info!("draining trailing output");
        self.drain_trailing_output().await?;

        let capture = self.take_capture();
        let collected = ExecutionResult::from_collector_slot(&slot)
            .or_else(|| ExecutionResult::from_summary(&slot));
        let Some(collected) = collected else {
            return Err(RunError::Eval {
                reason: format!("result slot holds an unrecognized value: {slot}"),
                capture,
            });
        };
        Ok(ExecutionResult {
            stdout_lines: split_output_lines(&capture.stdout),
            stderr_lines: split_output_lines(&capture.stderr),
            ..collected
        })
    }

    async fn select_target(&mut self, target: &str) -> Result<(), RunError> {
        let forms = self.forms;
        let select = forms.select_target(target);
        self.step_call(&select, None).await?;

        let probe = forms.echo_probe();
        let frames = match self.step_call(&probe.code, forms.namespace()).await {
            Ok(frames) => frames,
            Err(RunError::Remote { message, capture }) => {
                return Err(RunError::TargetUnreachable {
                    target: target.to_string(),
                    detail: format!("echo failed: {message}"),
                    capture,
                })
            }
            Err(error) => return Err(error),
        };
        let echoed = last_value(&frames).map(str::trim);
        if echoed == Some(probe.expected.as_str()) {
            return Ok(());
        }
        let detail = match echoed {
            Some(value) => format!("echo returned {value}, expected {}", probe.expected),
            None => format!("echo returned no value, expected {}", probe.expected),
        };
        Err(RunError::TargetUnreachable {
            target: target.to_string(),
            detail,
            capture: self.take_capture(),
        })
    }

    /// Runs one call and records its frames; an explicit remote failure is
    /// returned as `Remote`.
    async fn step_call(&mut self, code: &str, ns: Option<&str>) -> Result<Vec<Frame>, RunError> {
        let outcome = self
            .session
            .call("eval", Some(code), ns, self.timings.call_timeout)
            .await;
        let frames = match outcome {
            Ok(frames) => frames,
            Err(error) => return Err(self.transport_failure(error)),
        };
        self.capture.record_frames(frames.clone());
        self.capture
            .record_side_channel(self.session.take_side_channel());
        if let Some(message) = remote_failure(&frames) {
            return Err(RunError::Remote {
                message,
                capture: self.take_capture(),
            });
        }
        Ok(frames)
    }

    fn expect_ack(frames: &[Frame], ack: &str) -> Result<(), String> {
        match last_value(frames).map(str::trim) {
            Some(value) if value == ack => Ok(()),
            Some(value) => Err(format!("expected {ack}, got {value}")),
            None => Err(format!("expected {ack}, got no value")),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn poll_for_result(&mut self) -> Result<EdnValue, RunError> {
        let deadline = Instant::now() + self.timings.poll_timeout;
        let forms = self.forms;
        let peek = forms.peek_result(&self.collector);
        let mut state = PollState::default();
        loop {
            let remaining = remaining_until(deadline.into_std(), std::time::Instant::now());
            if remaining.is_zero() {
                return Err(self.poll_timeout(state));
            }
            state.attempt += 1;
            let outcome = self
                .session
                .call(
                    "eval",
                    Some(&peek),
                    forms.namespace(),
                    self.timings.call_timeout.min(remaining),
                )
                .await;
            let frames = match outcome {
                Ok(frames) => frames,
                Err(error) if error.is_timeout() && Instant::now() >= deadline => {
                    self.capture.record_frames(error.frames().to_vec());
                    return Err(self.poll_timeout(state));
                }
                Err(error) => return Err(self.transport_failure(error)),
            };
            let raw = last_value(&frames).map(str::to_string);
            let failure = remote_failure(&frames);
            self.capture.record_frames(frames);
            self.capture
                .record_side_channel(self.session.take_side_channel());
            if let Some(message) = failure {
                tracing::debug!(attempt = state.attempt, "peek raised");
                return Err(RunError::Remote {
                    message,
                    capture: self.take_capture(),
                });
            }

            if let Some(raw) = raw {
                let decoded = decode_poll_value(&raw);
                tracing::debug!(
                    attempt = state.attempt,
                    raw = raw.as_str(),
                    "poll attempt"
                );
                if let Some(value) = decoded.filter(|value| !is_empty_slot(value)) {
                    return Ok(value);
                }
                state.last_raw = Some(raw);
            }

            if Instant::now() + self.timings.poll_interval >= deadline {
                tokio::time::sleep_until(deadline).await;
                return Err(self.poll_timeout(state));
            }
            tokio::time::sleep(self.timings.poll_interval).await;
        }
    }

    fn poll_timeout(&mut self, state: PollState) -> RunError {
        RunError::PollTimeout {
            timeout_ms: u64::try_from(self.timings.poll_timeout.as_millis()).unwrap_or(u64::MAX),
            attempts: state.attempt,
            last_raw: state.last_raw,
            capture: self.take_capture(),
        }
    }

    /// Reads unsolicited frames until the quiet window passes without one.
    ///
    /// Every frame restarts the window; `drain_max` bounds the whole drain.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn drain_trailing_output(&mut self) -> Result<(), RunError> {
        let hard_deadline = Instant::now() + self.timings.drain_max;
        let mut quiet_deadline = (Instant::now() + self.timings.drain_quiet).min(hard_deadline);
        let mut drained = 0_usize;
        loop {
            match self.session.read_unsolicited_until(quiet_deadline).await {
                Ok(Some(_)) => {
                    drained += 1;
                    quiet_deadline =
                        (Instant::now() + self.timings.drain_quiet).min(hard_deadline);
                }
                Ok(None) => break,
                Err(TransportError::Closed { .. }) => {
                    tracing::debug!("connection closed while draining");
                    break;
                }
                Err(error) => return Err(self.transport_failure(error)),
            }
        }
        tracing::debug!(frames = drained, "drain finished");
        self.capture
            .record_side_channel(self.session.take_side_channel());
        Ok(())
    }

    fn transport_failure(&mut self, error: TransportError) -> RunError {
        let capture = self.take_capture();
        RunError::transport(error, capture)
    }

    fn take_capture(&mut self) -> Capture {
        let mut capture = std::mem::take(&mut self.capture);
        capture.record_side_channel(self.session.take_side_channel());
        capture
    }
}

/// Runs the orchestrated sequence with deadlines from `config`.
pub async fn run_orchestrated<S, F>(
    session: &mut Session<S>,
    forms: &F,
    target: &str,
    units: &[String],
    config: &RunnerConfig,
) -> Result<ExecutionResult, RunError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: ExecutionForms,
{
    Orchestrator::new(session, forms, OrchestratorTimings::from(config))
        .run(target, units)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forms::EchoProbe;
    use replcheck_report::{FailureKind, TestCounts};
    use replcheck_transport::fake_server::{value_reply, ScriptedReply, ScriptedServer};
    use replcheck_transport::{Connection, DoneMatching, Request};

    /// Short literal forms so the scripted server can route on exact code.
    struct PlainForms;

    impl ExecutionForms for PlainForms {
        fn namespace(&self) -> Option<&str> {
            Some("cljs.user")
        }

        fn select_target(&self, target: &str) -> String {
            format!("select {target}")
        }

        fn echo_probe(&self) -> EchoProbe {
            EchoProbe {
                code: "echo".to_string(),
                expected: "\"pong\"".to_string(),
            }
        }

        fn install_collector(&self, _collector: &ResultCollector) -> String {
            "install".to_string()
        }

        fn reload_unit(&self, unit: &str) -> String {
            format!("reload {unit}")
        }

        fn start_execution(&self, _units: &[String]) -> String {
            "start".to_string()
        }

        fn peek_result(&self, _collector: &ResultCollector) -> String {
            "peek".to_string()
        }
    }

    fn pr_str(text: &str) -> String {
        format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
    }

    const SLOT: &str = r#"{:counts {:test 2 :pass 1 :fail 1 :error 0} :failures [{:kind :fail :context ["math"] :name "app.core-test/adds" :message nil :expected "(= 3 (add 1 1))" :actual "(not (= 3 2))" :file "app/core_test.cljs" :line 14}]}"#;

    fn fast_timings() -> OrchestratorTimings {
        OrchestratorTimings {
            call_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(5),
            poll_timeout: Duration::from_secs(2),
            drain_quiet: Duration::from_millis(150),
            drain_max: Duration::from_secs(2),
        }
    }

    async fn session_for(server: &ScriptedServer) -> Session {
        let connection = Connection::open(&server.host(), server.port(), Duration::from_secs(2))
            .await
            .expect("connect");
        Session::establish(connection, Duration::from_secs(2), DoneMatching::Correlated)
            .await
            .expect("session")
    }

    fn happy_responder(empty_polls: usize) -> impl FnMut(&Request) -> Vec<ScriptedReply> + Send {
        let mut polls = 0_usize;
        move |request: &Request| match request.code.as_deref().unwrap_or_default() {
            "echo" => value_reply(request, "\"pong\""),
            "install" => value_reply(request, ":replcheck/installed"),
            code if code.starts_with("reload ") => value_reply(request, ":replcheck/reloaded"),
            "start" => {
                let mut replies = vec![ScriptedReply::from(
                    Frame::reply("background-run").with_out("Testing app.core-test\n"),
                )];
                replies.extend(value_reply(request, ":replcheck/pending"));
                replies
            }
            "peek" => {
                polls += 1;
                if polls <= empty_polls {
                    value_reply(request, "nil")
                } else {
                    let mut replies = value_reply(request, &pr_str(SLOT));
                    replies.push(ScriptedReply::Pause(Duration::from_millis(40)));
                    replies.push(Frame::default().with_out("Ran 2 tests containing 2 assertions.\n").into());
                    replies.push(ScriptedReply::Pause(Duration::from_millis(40)));
                    replies.push(Frame::default().with_err("1 failures, 0 errors.\n").into());
                    replies
                }
            }
            _ => value_reply(request, "nil"),
        }
    }

    #[test]
    fn unit_decode_poll_value_reads_double_encoded_map() {
        let value = decode_poll_value(&pr_str("{:counts {:test 1}}")).expect("decoded");
        assert!(matches!(value, EdnValue::Map(_)));
        let plain = decode_poll_value("{:counts {:test 1}}").expect("decoded");
        assert!(matches!(plain, EdnValue::Map(_)));
    }

    #[test]
    fn unit_decode_poll_value_falls_back_to_first_pass_string() {
        let value = decode_poll_value("\"{:unterminated\"").expect("decoded");
        assert_eq!(value, EdnValue::String("{:unterminated".to_string()));
        assert!(decode_poll_value("{:broken").is_none());
        assert!(is_empty_slot(&decode_poll_value("nil").expect("nil")));
    }

    #[tokio::test]
    async fn integration_orchestrator_runs_all_steps_and_collects_output() {
        let server = ScriptedServer::start(happy_responder(2)).await.expect("server");
        let mut session = session_for(&server).await;

        let units = vec!["app.core-test".to_string(), "app.util-test".to_string()];
        let result = Orchestrator::new(&mut session, &PlainForms, fast_timings())
            .run("app", &units)
            .await
            .expect("orchestrated run");

        assert_eq!(
            result.counts,
            TestCounts {
                total: 2,
                pass: 1,
                fail: 1,
                error: 0
            }
        );
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].kind, FailureKind::Fail);
        assert_eq!(result.failures[0].context, vec!["math"]);
        assert_eq!(
            result.stdout_lines,
            vec!["Testing app.core-test", "Ran 2 tests containing 2 assertions."]
        );
        assert_eq!(result.stderr_lines, vec!["1 failures, 0 errors."]);

        let codes = server
            .requests()
            .into_iter()
            .filter(|request| request.op == "eval")
            .filter_map(|request| request.code)
            .collect::<Vec<_>>();
        assert_eq!(
            codes,
            vec![
                "select app",
                "echo",
                "install",
                "reload app.core-test",
                "reload app.util-test",
                "start",
                "peek",
                "peek",
                "peek",
            ]
        );
        session.close().await.expect("close");
    }

    #[tokio::test]
    async fn regression_echo_mismatch_is_target_unreachable() {
        let server = ScriptedServer::start(|request: &Request| {
            match request.code.as_deref().unwrap_or_default() {
                "echo" => value_reply(request, "\"clj\""),
                _ => value_reply(request, "nil"),
            }
        })
        .await
        .expect("server");
        let mut session = session_for(&server).await;

        let error = Orchestrator::new(&mut session, &PlainForms, fast_timings())
            .run("app", &["app.core-test".to_string()])
            .await
            .expect_err("unreachable");
        let RunError::TargetUnreachable { target, detail, capture } = &error else {
            panic!("expected unreachable target, got {error:?}");
        };
        assert_eq!(target, "app");
        assert!(detail.contains("\"clj\""));
        assert_eq!(capture.frames.len(), 4);
    }

    #[tokio::test]
    async fn regression_missing_install_ack_is_collector_install_error() {
        let server = ScriptedServer::start(|request: &Request| {
            match request.code.as_deref().unwrap_or_default() {
                "echo" => value_reply(request, "\"pong\""),
                "install" => value_reply(request, ":something-else"),
                _ => value_reply(request, "nil"),
            }
        })
        .await
        .expect("server");
        let mut session = session_for(&server).await;

        let error = Orchestrator::new(&mut session, &PlainForms, fast_timings())
            .run("app", &["app.core-test".to_string()])
            .await
            .expect_err("install failure");
        assert!(matches!(error, RunError::CollectorInstall { .. }), "{error:?}");
        assert!(error.to_string().contains(":something-else"));
    }

    #[tokio::test]
    async fn regression_reload_exception_is_remote_error_with_capture() {
        let server = ScriptedServer::start(|request: &Request| {
            match request.code.as_deref().unwrap_or_default() {
                "echo" => value_reply(request, "\"pong\""),
                "install" => value_reply(request, ":replcheck/installed"),
                code if code.starts_with("reload ") => {
                    let mut failure = Frame::reply(&request.id)
                        .with_err("No such namespace: app.missing-test\n")
                        .with_status(&["eval-error"]);
                    failure.ex = Some("class clojure.lang.ExceptionInfo".to_string());
                    vec![
                        failure.into(),
                        Frame::reply(&request.id).with_status(&["done"]).into(),
                    ]
                }
                _ => value_reply(request, "nil"),
            }
        })
        .await
        .expect("server");
        let mut session = session_for(&server).await;

        let error = Orchestrator::new(&mut session, &PlainForms, fast_timings())
            .run("app", &["app.missing-test".to_string()])
            .await
            .expect_err("reload failure");
        let RunError::Remote { message, capture } = &error else {
            panic!("expected remote error, got {error:?}");
        };
        assert!(message.contains("No such namespace"));
        assert!(capture.stderr.contains("app.missing-test"));
    }

    #[tokio::test]
    async fn functional_poll_times_out_when_slot_stays_empty() {
        let server = ScriptedServer::start(happy_responder(usize::MAX))
            .await
            .expect("server");
        let mut session = session_for(&server).await;
        let timings = OrchestratorTimings {
            poll_timeout: Duration::from_millis(120),
            ..fast_timings()
        };

        let started = Instant::now();
        let error = Orchestrator::new(&mut session, &PlainForms, timings)
            .run("app", &["app.core-test".to_string()])
            .await
            .expect_err("poll timeout");
        let RunError::PollTimeout {
            timeout_ms,
            attempts,
            last_raw,
            capture,
        } = &error
        else {
            panic!("expected poll timeout, got {error:?}");
        };
        assert_eq!(*timeout_ms, 120);
        assert!(*attempts >= 2, "attempts: {attempts}");
        assert_eq!(last_raw.as_deref(), Some("nil"));
        assert!(capture.stdout.contains("Testing app.core-test"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn regression_peek_exception_is_remote_error_without_retry() {
        let mut responder = happy_responder(0);
        let server = ScriptedServer::start(move |request: &Request| {
            if request.code.as_deref() != Some("peek") {
                return responder(request);
            }
            let mut failure = Frame::reply(&request.id)
                .with_err("Use of undeclared Var cljs.user/replcheck-result\n")
                .with_status(&["eval-error"]);
            failure.ex = Some("class clojure.lang.ExceptionInfo".to_string());
            vec![
                failure.into(),
                Frame::reply(&request.id).with_status(&["done"]).into(),
            ]
        })
        .await
        .expect("server");
        let mut session = session_for(&server).await;

        let started = Instant::now();
        let error = Orchestrator::new(&mut session, &PlainForms, fast_timings())
            .run("app", &["app.core-test".to_string()])
            .await
            .expect_err("peek failure");
        assert!(started.elapsed() < Duration::from_secs(1));
        let RunError::Remote { message, capture } = &error else {
            panic!("expected remote error, got {error:?}");
        };
        assert!(message.contains("undeclared Var"), "{message}");
        assert!(capture.stdout.contains("Testing app.core-test"));
        let peeks = server
            .requests()
            .into_iter()
            .filter(|request| request.code.as_deref() == Some("peek"))
            .count();
        assert_eq!(peeks, 1);
    }

    #[tokio::test]
    async fn functional_drain_stops_after_quiet_window_without_trailing_frames() {
        let server = ScriptedServer::start(|request: &Request| {
            match request.code.as_deref().unwrap_or_default() {
                "echo" => value_reply(request, "\"pong\""),
                "install" => value_reply(request, ":replcheck/installed"),
                code if code.starts_with("reload ") => value_reply(request, ":replcheck/reloaded"),
                "start" => value_reply(request, ":replcheck/pending"),
                "peek" => value_reply(request, "\"{:counts {:test 1 :pass 1 :fail 0 :error 0} :failures []}\""),
                _ => value_reply(request, "nil"),
            }
        })
        .await
        .expect("server");
        let mut session = session_for(&server).await;
        let timings = OrchestratorTimings {
            drain_quiet: Duration::from_millis(50),
            ..fast_timings()
        };

        let started = Instant::now();
        let result = run_orchestrated_with(&mut session, timings).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(result.counts.pass, 1);
        assert!(result.stdout_lines.is_empty());
    }

    async fn run_orchestrated_with(session: &mut Session, timings: OrchestratorTimings) -> ExecutionResult {
        Orchestrator::new(session, &PlainForms, timings)
            .run("app", &["app.core-test".to_string()])
            .await
            .expect("orchestrated run")
    }
}
