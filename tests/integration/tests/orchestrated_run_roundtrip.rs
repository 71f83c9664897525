use std::time::Duration;

use replcheck_report::{render_report, FailureKind, NormalizerConfig, TestCounts, STDOUT_END};
use replcheck_runtime::{
    clojure_test_submission, connect_session, run_orchestrated, run_submissions, ExecutionForms,
    RunError, RunnerConfig, ShadowCljsForms,
};
use replcheck_transport::fake_server::{value_reply, ScriptedReply, ScriptedServer};
use replcheck_transport::{DoneMatching, Frame, Request};

const SLOT: &str = r##"{:counts {:test 3 :pass 1 :fail 1 :error 1}
 :failures [{:kind :fail :context ["arithmetic" "addition"] :name "app.core-test/adds"
             :message "small numbers" :expected "(= 3 (add 1 1))" :actual "(not (= 3 2))"
             :file "app/core_test.cljs" :line 14}
            {:kind :error :context [] :name "app.core-test/explodes" :message nil
             :expected "nil" :actual "#object[Error Error: boom]"
             :file "app/core_test.cljs" :line 30}]}"##;

fn pr_str(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

fn fast_config(port: u16) -> RunnerConfig {
    RunnerConfig {
        port: Some(port),
        connect_timeout_ms: 2_000,
        clone_timeout_ms: 2_000,
        call_timeout_ms: 2_000,
        poll_interval_ms: 5,
        poll_timeout_ms: 3_000,
        drain_quiet_ms: 100,
        drain_max_ms: 2_000,
        ..RunnerConfig::default()
    }
}

/// Answers the shadow-cljs forms the way a build runtime would.
fn shadow_build_responder() -> impl FnMut(&Request) -> Vec<ScriptedReply> + Send {
    let echo_code = ShadowCljsForms.echo_probe().code;
    let mut peeks = 0_u32;
    move |request: &Request| {
        let code = request.code.clone().unwrap_or_default();
        if code.starts_with("(shadow.cljs.devtools.api/nrepl-select") {
            return value_reply(request, "[:selected :app]");
        }
        if code == echo_code {
            return value_reply(request, "\"replcheck-echo:true\"");
        }
        if code.contains("defmethod cljs.test/report") {
            return value_reply(request, ":replcheck/installed");
        }
        if code.starts_with("(require '") {
            return vec![
                Frame::reply(&request.id).with_value("nil").into(),
                Frame::reply(&request.id).with_value(":replcheck/reloaded").into(),
                Frame::reply(&request.id).with_status(&["done"]).into(),
            ];
        }
        if code.contains("js/setTimeout") {
            let mut replies = value_reply(request, ":replcheck/pending");
            replies.push(Frame::reply("background").with_out("\nTesting app.core-test\n").into());
            return replies;
        }
        if code == "@cljs.user/replcheck-result" {
            peeks += 1;
            if peeks < 3 {
                return value_reply(request, "nil");
            }
            let mut replies = value_reply(request, &pr_str(SLOT));
            replies.push(ScriptedReply::Pause(Duration::from_millis(20)));
            replies.push(
                Frame::default()
                    .with_out("\nRan 3 tests containing 3 assertions.\n1 failures, 1 errors.\n")
                    .into(),
            );
            return replies;
        }
        value_reply(request, "nil")
    }
}

#[tokio::test]
async fn integration_shadow_forms_orchestrated_run_renders_failure_report() {
    let server = ScriptedServer::start(shadow_build_responder())
        .await
        .expect("server");
    let config = fast_config(server.port());
    let mut session = connect_session(&server.host(), server.port(), &config)
        .await
        .expect("session");

    let units = vec!["app.core-test".to_string()];
    let result = run_orchestrated(&mut session, &ShadowCljsForms, "app", &units, &config)
        .await
        .expect("orchestrated run");
    session.close().await.expect("close");

    assert_eq!(
        result.counts,
        TestCounts {
            total: 3,
            pass: 1,
            fail: 1,
            error: 1
        }
    );
    assert_eq!(result.exit_status(), 2);
    assert_eq!(result.failures.len(), 2);
    assert_eq!(result.failures[1].kind, FailureKind::Error);
    assert_eq!(result.failures[1].message, None);

    let report = render_report(&result, &NormalizerConfig::default());
    let lines = report.lines().collect::<Vec<_>>();
    let fail_at = lines
        .iter()
        .position(|line| *line == "FAIL in app.core-test/adds (app/core_test.cljs:14)")
        .expect("fail block");
    assert_eq!(lines[fail_at + 1], "context: arithmetic > addition");
    assert_eq!(lines[fail_at + 2], "small numbers");
    assert_eq!(lines[fail_at + 3], "expected: (= 3 (add 1 1))");
    assert_eq!(lines[fail_at + 4], "  actual: (not (= 3 2))");
    assert!(lines.contains(&"ERROR in app.core-test/explodes (app/core_test.cljs:30)"));
    let summary_at = lines
        .iter()
        .position(|line| *line == "Ran 3 tests containing 3 assertions.")
        .expect("trailing summary");
    let end_at = lines
        .iter()
        .position(|line| *line == STDOUT_END)
        .expect("stdout end");
    assert!(summary_at < fail_at && fail_at < end_at);

    let requests = server.requests();
    let peek = requests
        .iter()
        .find(|request| request.code.as_deref() == Some("@cljs.user/replcheck-result"))
        .expect("peek request");
    assert_eq!(peek.ns.as_deref(), Some("cljs.user"));
    assert_eq!(peek.session.as_deref(), Some("fake-session"));
    let select = requests
        .iter()
        .find(|request| {
            request
                .code
                .as_deref()
                .is_some_and(|code| code.contains("nrepl-select"))
        })
        .expect("select request");
    assert_eq!(select.ns, None);
}

/// Replies without request ids, as older servers do.
fn uncorrelated_responder(_request: &Request) -> Vec<ScriptedReply> {
    vec![
        Frame::default()
            .with_value(r#"{:test 1 :pass 1 :fail 0 :error 0 :out "Testing app.core-test" :err ""}"#)
            .into(),
        Frame::default().with_status(&["done"]).into(),
    ]
}

#[tokio::test]
async fn integration_legacy_done_matching_completes_uncorrelated_replies() {
    let server = ScriptedServer::start(uncorrelated_responder)
        .await
        .expect("server");
    let config = RunnerConfig {
        done_matching: DoneMatching::Legacy,
        ..fast_config(server.port())
    };
    let mut session = connect_session(&server.host(), server.port(), &config)
        .await
        .expect("session");

    let submissions = vec![clojure_test_submission("app.core-test")];
    let result = run_submissions(&mut session, &submissions, config.call_timeout())
        .await
        .expect("legacy run");
    assert_eq!(result.counts.pass, 1);
    assert_eq!(result.stdout_lines, vec!["Testing app.core-test"]);
}

#[tokio::test]
async fn regression_correlated_matching_times_out_on_uncorrelated_replies() {
    let server = ScriptedServer::start(uncorrelated_responder)
        .await
        .expect("server");
    let config = fast_config(server.port());
    let mut session = connect_session(&server.host(), server.port(), &config)
        .await
        .expect("session");

    let submissions = vec![clojure_test_submission("app.core-test")];
    let error = run_submissions(&mut session, &submissions, Duration::from_millis(150))
        .await
        .expect_err("never completes");
    let RunError::Transport { source, capture } = &error else {
        panic!("expected transport timeout, got {error:?}");
    };
    assert!(source.is_timeout());
    assert_eq!(capture.frames.len(), 2);
}
