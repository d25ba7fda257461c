//! Backend response contract.
//!
//! A successful run prints `{"result": "...", "session_id": "..."}`. Error
//! shapes are `{"is_error": true, "result": "..."}` and
//! `{"subtype": "error_during_execution", "errors": [...], "result"?, "session_id"?}`.
//! Anything else is malformed.
//!
//! Marker checks (session not found, prompt too long) only look at error
//! text: stderr, unparseable stdout, or the message of an error document. A
//! successful result that happens to mention those phrases is still a success.

use senseloop_core::error::InvocationError;
use serde_json::Value;

const SESSION_NOT_FOUND_MARKERS: [&str; 2] = ["no conversation found", "session not found"];
const PROMPT_TOO_LONG_MARKERS: [&str; 3] = [
    "prompt is too long",
    "prompt too long",
    "context length exceeded",
];

const ERROR_DURING_EXECUTION: &str = "error_during_execution";

/// Captured output of one backend run, already decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Why a run is repeated without its session token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    SessionNotFound,
    PromptTooLong,
    Unparseable,
}

/// What the engine should do with one run's output.
#[derive(Debug, Clone)]
pub enum Verdict {
    /// Unsanitized result text plus the session id, if any.
    Success {
        text: String,
        session_id: Option<String>,
    },
    /// Execution errored but produced no usable result.
    NoOutput,
    RetryWithoutSession(RetryReason),
    Fail(InvocationError),
}

/// Classify a run's output. `had_token` says whether `--resume` was passed.
pub fn evaluate(output: &ProcessOutput, had_token: bool) -> Verdict {
    let document = serde_json::from_str::<Value>(output.stdout.trim())
        .ok()
        .filter(Value::is_object);

    let Some(doc) = document else {
        let error_text = format!("{}\n{}", output.stderr, output.stdout);
        if let Some(verdict) = marker_verdict(&error_text, had_token) {
            return verdict;
        }
        if had_token {
            return Verdict::RetryWithoutSession(RetryReason::Unparseable);
        }
        let diagnostic = diagnostic_of(output);
        return match output.exit_code {
            Some(0) => Verdict::Fail(InvocationError::MalformedResponse {
                exit_code: output.exit_code,
                diagnostic,
            }),
            code => Verdict::Fail(InvocationError::NonZeroExit {
                code,
                message: failure_message(output),
                diagnostic,
            }),
        };
    };

    let result = doc.get("result").and_then(Value::as_str);
    let session_id = doc
        .get("session_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned);

    if doc.get("is_error").and_then(Value::as_bool) == Some(true) {
        let error_text = format!("{}\n{}", output.stderr, error_message(&doc));
        if let Some(verdict) = marker_verdict(&error_text, had_token) {
            return verdict;
        }
        return Verdict::Fail(InvocationError::BackendReported {
            message: error_text.trim().to_string(),
            diagnostic: diagnostic_of(output),
        });
    }

    if doc.get("subtype").and_then(Value::as_str) == Some(ERROR_DURING_EXECUTION) {
        if had_token && contains_any(&error_message(&doc), &SESSION_NOT_FOUND_MARKERS) {
            return Verdict::RetryWithoutSession(RetryReason::SessionNotFound);
        }
        return match result.filter(|r| !r.trim().is_empty()) {
            Some(text) => Verdict::Success {
                text: text.to_string(),
                session_id,
            },
            None => Verdict::NoOutput,
        };
    }

    match result {
        Some(text) => Verdict::Success {
            text: text.to_string(),
            session_id,
        },
        None => Verdict::Fail(InvocationError::MalformedResponse {
            exit_code: output.exit_code,
            diagnostic: diagnostic_of(output),
        }),
    }
}

/// Rules 1 and 2: session-not-found and prompt-too-long markers.
fn marker_verdict(error_text: &str, had_token: bool) -> Option<Verdict> {
    if had_token && contains_any(error_text, &SESSION_NOT_FOUND_MARKERS) {
        return Some(Verdict::RetryWithoutSession(RetryReason::SessionNotFound));
    }
    if contains_any(error_text, &PROMPT_TOO_LONG_MARKERS) {
        return Some(if had_token {
            Verdict::RetryWithoutSession(RetryReason::PromptTooLong)
        } else {
            Verdict::Fail(InvocationError::PromptTooLong)
        });
    }
    None
}

fn error_message(doc: &Value) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(result) = doc.get("result").and_then(Value::as_str) {
        parts.push(result);
    }
    if let Some(errors) = doc.get("errors").and_then(Value::as_array) {
        parts.extend(errors.iter().filter_map(Value::as_str));
    }
    parts.join("\n")
}

fn contains_any(text: &str, markers: &[&str]) -> bool {
    let lower = text.to_lowercase();
    markers.iter().any(|m| lower.contains(m))
}

/// Error text of a failed run that printed no JSON document: stderr, or the
/// raw stdout when stderr is empty.
fn failure_message(output: &ProcessOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        output.stdout.trim().to_string()
    } else {
        stderr.to_string()
    }
}

fn diagnostic_of(output: &ProcessOutput) -> String {
    format!(
        "exit={:?} stdout={:?} stderr={:?}",
        output.exit_code, output.stdout, output.stderr
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out(stdout: &str, exit_code: i32) -> ProcessOutput {
        ProcessOutput {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(exit_code),
        }
    }

    #[test]
    fn success_document() {
        match evaluate(&out(r#"{"result": "hi", "session_id": "s1"}"#, 0), true) {
            Verdict::Success { text, session_id } => {
                assert_eq!(text, "hi");
                assert_eq!(session_id.as_deref(), Some("s1"));
            }
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    #[test]
    fn success_mentioning_marker_is_still_success() {
        let verdict = evaluate(
            &out(r#"{"result": "The error said prompt is too long.", "session_id": "s1"}"#, 0),
            true,
        );
        assert!(matches!(verdict, Verdict::Success { .. }));
    }

    #[test]
    fn session_not_found_retries_only_with_token() {
        let output = ProcessOutput {
            stdout: String::new(),
            stderr: "Error: No conversation found with session ID abc".into(),
            exit_code: Some(1),
        };
        assert!(matches!(
            evaluate(&output, true),
            Verdict::RetryWithoutSession(RetryReason::SessionNotFound)
        ));
        assert!(matches!(
            evaluate(&output, false),
            Verdict::Fail(InvocationError::NonZeroExit { code: Some(1), .. })
        ));
    }

    #[test]
    fn prompt_too_long_error_document() {
        let doc = r#"{"is_error": true, "result": "Prompt is too long"}"#;
        assert!(matches!(
            evaluate(&out(doc, 1), true),
            Verdict::RetryWithoutSession(RetryReason::PromptTooLong)
        ));
        assert!(matches!(
            evaluate(&out(doc, 1), false),
            Verdict::Fail(InvocationError::PromptTooLong)
        ));
    }

    #[test]
    fn other_error_document_is_backend_reported() {
        let verdict = evaluate(&out(r#"{"is_error": true, "result": "overloaded"}"#, 1), true);
        match verdict {
            Verdict::Fail(err @ InvocationError::BackendReported { .. }) => {
                assert!(err.diagnostic().unwrap().contains("overloaded"));
                assert_eq!(err.error_text(), Some("overloaded"));
                assert!(!err.to_string().contains("overloaded"));
            }
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    #[test]
    fn unparseable_output() {
        assert!(matches!(
            evaluate(&out("segfault!", 0), true),
            Verdict::RetryWithoutSession(RetryReason::Unparseable)
        ));
        assert!(matches!(
            evaluate(&out("segfault!", 0), false),
            Verdict::Fail(InvocationError::MalformedResponse { exit_code: Some(0), .. })
        ));
        assert!(matches!(
            evaluate(&out("segfault!", 139), false),
            Verdict::Fail(InvocationError::NonZeroExit { code: Some(139), .. })
        ));
    }

    #[test]
    fn error_during_execution_with_and_without_result() {
        let with = r#"{"subtype": "error_during_execution", "errors": ["tool crashed"], "result": "partial answer", "session_id": "s2"}"#;
        match evaluate(&out(with, 0), false) {
            Verdict::Success { text, session_id } => {
                assert_eq!(text, "partial answer");
                assert_eq!(session_id.as_deref(), Some("s2"));
            }
            other => panic!("unexpected verdict: {other:?}"),
        }

        let without = r#"{"subtype": "error_during_execution", "errors": ["tool crashed"], "session_id": "s2"}"#;
        assert!(matches!(evaluate(&out(without, 0), false), Verdict::NoOutput));
    }

    #[test]
    fn missing_result_is_malformed() {
        assert!(matches!(
            evaluate(&out(r#"{"session_id": "s1"}"#, 0), false),
            Verdict::Fail(InvocationError::MalformedResponse { .. })
        ));
        assert!(matches!(
            evaluate(&out(r#"["result"]"#, 0), false),
            Verdict::Fail(InvocationError::MalformedResponse { .. })
        ));
    }
}
