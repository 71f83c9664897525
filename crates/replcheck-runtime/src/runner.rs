use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use replcheck_core::parse_edn;
use replcheck_report::{combine, split_output_lines, ExecutionResult};
use replcheck_transport::{last_value, remote_failure, Connection, Session};

use crate::config::RunnerConfig;
use crate::error::{Capture, RunError};

/// Opens a connection and clones a session using `config`'s deadlines.
pub async fn connect_session(
    host: &str,
    port: u16,
    config: &RunnerConfig,
) -> Result<Session, RunError> {
    let connection = Connection::open(host, port, config.connect_timeout()).await?;
    Ok(Session::establish(connection, config.clone_timeout(), config.done_matching).await?)
}

/// Frames of one evaluation plus the output observed alongside it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    /// Last `value` carried by the call's own frames.
    pub value: Option<String>,
    pub capture: Capture,
}

/// Evaluates `code` and folds side-channel output into the capture.
///
/// Transport failures and remote exceptions keep everything captured so far.
pub async fn evaluate<S>(
    session: &mut Session<S>,
    code: &str,
    timeout: Duration,
) -> Result<Evaluation, RunError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frames = match session.eval(code, timeout).await {
        Ok(frames) => frames,
        Err(error) => {
            let mut capture = Capture::default();
            capture.record_side_channel(session.take_side_channel());
            return Err(RunError::transport(error, capture));
        }
    };
    let value = last_value(&frames).map(str::to_string);
    let failure = remote_failure(&frames);
    let mut capture = Capture::from_frames(frames);
    capture.record_side_channel(session.take_side_channel());

    if let Some(message) = failure {
        return Err(RunError::Remote { message, capture });
    }
    Ok(Evaluation { value, capture })
}

/// Evaluates one submission and decodes its summary map.
///
/// Output printed while the call ran is placed before the output the summary
/// itself captured.
#[tracing::instrument(level = "debug", skip(session, code))]
pub async fn run<S>(
    session: &mut Session<S>,
    code: &str,
    timeout: Duration,
) -> Result<ExecutionResult, RunError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Evaluation { value, capture } = evaluate(session, code, timeout).await?;
    let Some(raw) = value else {
        return Err(RunError::Eval {
            reason: "no value returned".to_string(),
            capture,
        });
    };
    let value = match parse_edn(&raw) {
        Ok(value) => value,
        Err(error) => {
            return Err(RunError::Eval {
                reason: format!("value is not a readable literal: {error}"),
                capture,
            })
        }
    };
    let Some(summary) = ExecutionResult::from_summary(&value) else {
        return Err(RunError::Eval {
            reason: format!("value is not a test summary: {value}"),
            capture,
        });
    };

    let mut stdout_lines = split_output_lines(&capture.stdout);
    stdout_lines.extend(summary.stdout_lines);
    let mut stderr_lines = split_output_lines(&capture.stderr);
    stderr_lines.extend(summary.stderr_lines);
    Ok(ExecutionResult {
        stdout_lines,
        stderr_lines,
        ..summary
    })
}

/// Runs every submission in order on one session and combines the results.
///
/// A submission without a usable value is dropped; any other failure stops
/// the run.
pub async fn run_submissions<S>(
    session: &mut Session<S>,
    submissions: &[String],
    timeout: Duration,
) -> Result<ExecutionResult, RunError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut results = Vec::with_capacity(submissions.len());
    for (index, code) in submissions.iter().enumerate() {
        match run(session, code, timeout).await {
            Ok(result) => results.push(Some(result)),
            Err(RunError::Eval { reason, .. }) => {
                tracing::warn!(submission = index, %reason, "submission dropped");
                results.push(None);
            }
            Err(error) => return Err(error),
        }
    }
    Ok(combine(results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use replcheck_report::TestCounts;
    use replcheck_transport::fake_server::{value_reply, ScriptedReply, ScriptedServer};
    use replcheck_transport::{DoneMatching, Frame};

    async fn session_for(server: &ScriptedServer) -> Session {
        let connection = Connection::open(&server.host(), server.port(), Duration::from_secs(2))
            .await
            .expect("connect");
        Session::establish(connection, Duration::from_secs(2), DoneMatching::Correlated)
            .await
            .expect("session")
    }

    #[tokio::test]
    async fn functional_run_decodes_summary_and_prepends_call_output() {
        let server = ScriptedServer::start(|request| {
            vec![
                Frame::reply(&request.id).with_out("loading\n").into(),
                Frame::reply(&request.id)
                    .with_value(r#"{:test 2 :pass 1 :fail 1 :error 0 :out "Testing app.core-test\nFAIL in (adds)" :err ""}"#)
                    .into(),
                Frame::reply(&request.id).with_status(&["done"]).into(),
            ]
        })
        .await
        .expect("server");
        let mut session = session_for(&server).await;

        let result = run(&mut session, "(run)", Duration::from_secs(2))
            .await
            .expect("run");
        assert_eq!(
            result.counts,
            TestCounts {
                total: 2,
                pass: 1,
                fail: 1,
                error: 0
            }
        );
        assert_eq!(
            result.stdout_lines,
            vec!["loading", "Testing app.core-test", "FAIL in (adds)"]
        );
        assert!(result.stderr_lines.is_empty());
        session.close().await.expect("close");
    }

    #[tokio::test]
    async fn regression_run_without_value_is_eval_error() {
        let server = ScriptedServer::start(|request| {
            vec![Frame::reply(&request.id).with_status(&["done"]).into()]
        })
        .await
        .expect("server");
        let mut session = session_for(&server).await;

        let error = run(&mut session, "(run)", Duration::from_secs(2))
            .await
            .expect_err("no value");
        assert!(matches!(error, RunError::Eval { .. }), "{error:?}");
    }

    #[tokio::test]
    async fn functional_run_reports_remote_exception_with_capture() {
        let server = ScriptedServer::start(|request| {
            let mut failure = Frame::reply(&request.id)
                .with_err("Syntax error compiling at (app/core_test.clj:3:1).\n")
                .with_status(&["eval-error"]);
            failure.ex = Some("class clojure.lang.Compiler$CompilerException".to_string());
            vec![
                failure.into(),
                Frame::reply(&request.id).with_status(&["done"]).into(),
            ]
        })
        .await
        .expect("server");
        let mut session = session_for(&server).await;

        let error = run(&mut session, "(run)", Duration::from_secs(2))
            .await
            .expect_err("remote failure");
        let RunError::Remote { message, capture } = &error else {
            panic!("expected remote error, got {error:?}");
        };
        assert!(message.starts_with("class clojure.lang.Compiler$CompilerException"));
        assert!(capture.stderr.contains("Syntax error"));
        assert_eq!(capture.frames.len(), 2);
    }

    #[tokio::test]
    async fn integration_run_submissions_drops_valueless_submission_and_combines() {
        let server = ScriptedServer::start(|request| {
            match request.code.as_deref() {
                Some("(first)") => value_reply(
                    request,
                    r#"{:test 3 :pass 3 :fail 0 :error 0 :out "A" :err ""}"#,
                ),
                Some("(second)") => vec![Frame::reply(&request.id).with_status(&["done"]).into()],
                _ => value_reply(request, r#"{:test 1 :pass 0 :fail 0 :error 1 :out "" :err "B"}"#),
            }
        })
        .await
        .expect("server");
        let mut session = session_for(&server).await;

        let submissions = vec![
            "(first)".to_string(),
            "(second)".to_string(),
            "(third)".to_string(),
        ];
        let result = run_submissions(&mut session, &submissions, Duration::from_secs(2))
            .await
            .expect("submissions");
        assert_eq!(
            result.counts,
            TestCounts {
                total: 4,
                pass: 3,
                fail: 0,
                error: 1
            }
        );
        assert_eq!(result.stdout_lines, vec!["A"]);
        assert_eq!(result.stderr_lines, vec!["B"]);
        let evals = server
            .requests()
            .into_iter()
            .filter(|request| request.op == "eval")
            .count();
        assert_eq!(evals, 3);
    }

    #[tokio::test]
    async fn regression_run_submissions_stops_on_transport_timeout() {
        let server = ScriptedServer::start(|request| {
            vec![
                Frame::reply(&request.id).with_out("still running\n").into(),
                ScriptedReply::Pause(Duration::from_secs(5)),
            ]
        })
        .await
        .expect("server");
        let mut session = session_for(&server).await;

        let error = run_submissions(
            &mut session,
            &["(slow)".to_string()],
            Duration::from_millis(100),
        )
        .await
        .expect_err("timeout");
        let RunError::Transport { source, capture } = &error else {
            panic!("expected transport error, got {error:?}");
        };
        assert!(source.is_timeout());
        assert_eq!(capture.stdout, "still running\n");
    }

    #[tokio::test]
    async fn regression_run_timeout_keeps_output_from_other_requests() {
        let server = ScriptedServer::start(|request| {
            vec![
                Frame::reply("background")
                    .with_out("diagnostic from elsewhere\n")
                    .into(),
                Frame::reply(&request.id).with_out("own\n").into(),
                ScriptedReply::Pause(Duration::from_secs(5)),
            ]
        })
        .await
        .expect("server");
        let mut session = session_for(&server).await;

        let error = run(&mut session, "(slow)", Duration::from_millis(150))
            .await
            .expect_err("timeout");
        let RunError::Transport { source, capture } = &error else {
            panic!("expected transport error, got {error:?}");
        };
        assert!(source.is_timeout());
        assert!(capture.stdout.contains("diagnostic from elsewhere\n"));
        assert!(capture.stdout.contains("own\n"));
        assert_eq!(capture.frames.len(), 2);
        assert!(session.take_side_channel().is_empty());
    }

    #[tokio::test]
    async fn functional_evaluate_folds_side_channel_but_keeps_own_value() {
        let server = ScriptedServer::start(|request| {
            vec![
                Frame::reply(&request.id).with_out("hello\n").into(),
                Frame::reply("background")
                    .with_out("tick\n")
                    .with_value(":other")
                    .into(),
                Frame::reply(&request.id).with_value("3").into(),
                Frame::reply(&request.id).with_status(&["done"]).into(),
            ]
        })
        .await
        .expect("server");
        let mut session = session_for(&server).await;

        let evaluation = evaluate(&mut session, "(+ 1 2)", Duration::from_secs(2))
            .await
            .expect("evaluate");
        assert_eq!(evaluation.value.as_deref(), Some("3"));
        assert_eq!(evaluation.capture.stdout, "hello\ntick\n");
        assert_eq!(evaluation.capture.frames.len(), 4);
    }
}
