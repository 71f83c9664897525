//! Code strings submitted by the runner and orchestrator.
//!
//! The transport treats code as opaque text; these builders are the only place
//! that knows what the remote side evaluates.

pub const INSTALLED_ACK: &str = ":replcheck/installed";
pub const RELOADED_ACK: &str = ":replcheck/reloaded";
pub const PENDING_ACK: &str = ":replcheck/pending";

/// Code plus the printed value it must evaluate to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoProbe {
    pub code: String,
    pub expected: String,
}

/// Remote result slot and failure list written by the installed report hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultCollector {
    namespace: String,
    slot: String,
    failures: String,
}

impl Default for ResultCollector {
    fn default() -> Self {
        Self::new("cljs.user")
    }
}

impl ResultCollector {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            slot: "replcheck-result".to_string(),
            failures: "replcheck-failures".to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn slot_symbol(&self) -> String {
        format!("{}/{}", self.namespace, self.slot)
    }

    pub fn failures_symbol(&self) -> String {
        format!("{}/{}", self.namespace, self.failures)
    }

    /// Defines both atoms once, empties them, and replaces the cljs.test
    /// `:fail`, `:error` and `:end-run-tests` report methods.
    ///
    /// The slot receives a `pr-str`'d `{:counts .. :failures ..}` map, so a
    /// peek returns a string literal holding the map.
    pub fn install_form(&self) -> String {
        let slot = self.slot_symbol();
        let failures = self.failures_symbol();
        let record = |kind: &str| {
            format!(
                r#"(defmethod cljs.test/report [:cljs.test/default :{kind}] [m]
    (cljs.test/inc-report-counter! :{kind})
    (let [env (cljs.test/get-current-env)
          test-var (first (:testing-vars env))
          test-meta (some-> test-var meta)]
      (swap! {failures} conj
             {{:kind :{kind}
              :context (vec (reverse (:testing-contexts env)))
              :name (if test-meta (str (:ns test-meta) "/" (:name test-meta)) "unknown")
              :message (:message m)
              :expected (pr-str (:expected m))
              :actual (pr-str (:actual m))
              :file (:file m)
              :line (:line m)}})))"#
            )
        };
        format!(
            r#"(do
  (defonce {slot_name} (atom nil))
  (defonce {failures_name} (atom []))
  (reset! {slot} nil)
  (reset! {failures} [])
  {fail_hook}
  {error_hook}
  (defmethod cljs.test/report [:cljs.test/default :end-run-tests] [m]
    (reset! {slot}
            (pr-str {{:counts (select-keys m [:test :pass :fail :error])
                     :failures @{failures}}})))
  {INSTALLED_ACK})"#,
            slot_name = self.slot,
            failures_name = self.failures,
            fail_hook = record("fail"),
            error_hook = record("error"),
        )
    }

    pub fn peek_form(&self) -> String {
        format!("@{}", self.slot_symbol())
    }
}

/// Builders for each orchestrated step.
pub trait ExecutionForms {
    /// Namespace the post-selection calls evaluate in.
    fn namespace(&self) -> Option<&str>;
    fn select_target(&self, target: &str) -> String;
    fn echo_probe(&self) -> EchoProbe;
    fn install_collector(&self, collector: &ResultCollector) -> String;
    fn reload_unit(&self, unit: &str) -> String;
    fn start_execution(&self, units: &[String]) -> String;
    fn peek_result(&self, collector: &ResultCollector) -> String;

    fn installed_ack(&self) -> &str {
        INSTALLED_ACK
    }

    fn reloaded_ack(&self) -> &str {
        RELOADED_ACK
    }

    fn pending_ack(&self) -> &str {
        PENDING_ACK
    }
}

/// shadow-cljs builds driven through cljs.test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadowCljsForms;

impl ExecutionForms for ShadowCljsForms {
    fn namespace(&self) -> Option<&str> {
        Some("cljs.user")
    }

    fn select_target(&self, target: &str) -> String {
        format!("(shadow.cljs.devtools.api/nrepl-select :{target})")
    }

    fn echo_probe(&self) -> EchoProbe {
        EchoProbe {
            code: "(str \"replcheck-echo:\" (some? js/goog))".to_string(),
            expected: "\"replcheck-echo:true\"".to_string(),
        }
    }

    fn install_collector(&self, collector: &ResultCollector) -> String {
        collector.install_form()
    }

    fn reload_unit(&self, unit: &str) -> String {
        format!("(require '{unit} :reload)\n{RELOADED_ACK}")
    }

    fn start_execution(&self, units: &[String]) -> String {
        let quoted = units
            .iter()
            .map(|unit| format!("'{unit}"))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "(do (js/setTimeout (fn [] (cljs.test/run-tests (cljs.test/empty-env) {quoted})) 0) {PENDING_ACK})"
        )
    }

    fn peek_result(&self, collector: &ResultCollector) -> String {
        collector.peek_form()
    }
}

/// JVM clojure.test submission for one namespace.
///
/// Evaluates to `{:test :pass :fail :error :out :err}` with the run's output
/// captured into the map instead of streamed.
pub fn clojure_test_submission(unit: &str) -> String {
    format!(
        r#"(do
  (require '{unit} :reload)
  (let [out (java.io.StringWriter.)
        err (java.io.StringWriter.)
        summary (binding [clojure.test/*test-out* out
                          *out* out
                          *err* err]
                  (clojure.test/run-tests '{unit}))]
    (assoc (select-keys summary [:test :pass :fail :error])
           :out (str out)
           :err (str err))))"#
    )
}

/// Accepts a namespace symbol such as `app.core-test`.
pub fn parse_unit_name(raw: &str) -> Result<String, String> {
    let unit = raw.trim();
    if unit.is_empty() {
        return Err("test unit name cannot be empty".to_string());
    }
    let valid = unit.chars().all(|ch| {
        ch.is_alphanumeric() || matches!(ch, '.' | '-' | '_' | '*' | '+' | '!' | '?' | '<' | '>' | '=')
    }) && !unit.starts_with(|ch: char| ch.is_ascii_digit() || ch == '.');
    if !valid {
        return Err(format!("'{unit}' is not a valid namespace name"));
    }
    Ok(unit.to_string())
}
