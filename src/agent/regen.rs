//! Regeneration Loop
//!
//! The generate -> extract -> execute -> repair loop at the heart of every
//! cycle stage. Each failed attempt feeds its error back into the next
//! generation request until something succeeds or the retry budget runs
//! out. The loop never errors: a stage that cannot produce working output
//! comes back as a failed, exhausted outcome for the cycle to judge.

use std::sync::Arc;

use tracing::{info, warn};

use crate::codegen::extract_code;
use crate::error::SentinelError;
use crate::types::{
    AttemptRecord, ExecutionResult, GenerationRequest, Generator, LoopOutcome, Sandbox,
};

pub struct RegenerationLoop {
    generator: Arc<dyn Generator>,
    sandbox: Arc<dyn Sandbox>,
}

impl RegenerationLoop {
    pub fn new(generator: Arc<dyn Generator>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self { generator, sandbox }
    }

    /// Drive one stage to success or retry exhaustion.
    ///
    /// `max_attempts` bounds both generation calls and executions. Errors
    /// accumulate across attempts so the model sees the full history of
    /// what failed, not only the latest fault.
    pub async fn run(&self, request: &GenerationRequest, max_attempts: u32) -> LoopOutcome {
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut err_acc = String::new();
        let mut current = request.clone();
        let mut last_code = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                info!(
                    "Regenerating {} (attempt {}/{})",
                    request.kind.as_str(),
                    attempt,
                    max_attempts
                );
                current = request.regenerating(attempt, err_acc.clone(), last_code.clone());
            }

            let response = match self.generator.generate(&current).await {
                Ok(response) => response,
                Err(e) => {
                    let fault = SentinelError::GenerationFailure(e.to_string());
                    warn!("{} attempt {}: {}", request.kind.as_str(), attempt, fault);
                    err_acc.push_str(&format!("\n{}", fault));
                    attempts.push(AttemptRecord {
                        attempt,
                        code: String::new(),
                        result: ExecutionResult::failed(fault.to_string()),
                    });
                    continue;
                }
            };

            let (code, result) = if current.kind.executes_code() {
                match extract_code(&response) {
                    Some(code) => {
                        let result = self.sandbox.execute(&code, &current.bound_env()).await;
                        (code, result)
                    }
                    None => (
                        String::new(),
                        ExecutionResult::failed(
                            "response contained no extractable code; respond with a complete program",
                        ),
                    ),
                }
            } else {
                // Text stages succeed on any non-empty response. Nothing
                // runs in the sandbox.
                let text = response.trim().to_string();
                if text.is_empty() {
                    (String::new(), ExecutionResult::failed("empty response"))
                } else {
                    (
                        String::new(),
                        ExecutionResult {
                            success: true,
                            stdout: text,
                            stderr: String::new(),
                            findings: None,
                            error: None,
                            duration_ms: 0,
                        },
                    )
                }
            };

            let success = result.success;
            if !success {
                if let Some(ref error) = result.error {
                    err_acc.push_str(&format!("\n{}", error));
                }
                if !code.is_empty() {
                    last_code = code.clone();
                }
            }

            attempts.push(AttemptRecord {
                attempt,
                code,
                result: result.clone(),
            });

            if success {
                info!(
                    "{} succeeded on attempt {}/{}",
                    request.kind.as_str(),
                    attempt,
                    max_attempts
                );
                return LoopOutcome {
                    result,
                    attempts,
                    exhausted: false,
                };
            }
        }

        warn!(
            "{} failed after {} attempts",
            request.kind.as_str(),
            max_attempts
        );
        let result = attempts.last().map(|a| a.result.clone()).unwrap_or_else(|| {
            ExecutionResult::failed(
                SentinelError::RetryBudgetExhausted {
                    attempts: max_attempts,
                }
                .to_string(),
            )
        });
        LoopOutcome {
            result,
            attempts,
            exhausted: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use crate::types::{MetricState, RequestKind};

    /// Generator returning a fixed script of responses, tracking calls.
    struct ScriptedGenerator {
        responses: Mutex<Vec<anyhow::Result<String>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedGenerator {
        fn new(responses: Vec<anyhow::Result<String>>) -> Self {
            let mut responses = responses;
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(0),
            }
        }

        fn call_count(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, _request: &GenerationRequest) -> anyhow::Result<String> {
            *self.calls.lock().unwrap() += 1;
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(anyhow::anyhow!("script exhausted")))
        }
    }

    /// Sandbox that fails N times, then succeeds.
    struct FlakySandbox {
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl Sandbox for FlakySandbox {
        async fn execute(&self, _code: &str, _env: &BTreeMap<String, String>) -> ExecutionResult {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                ExecutionResult::failed("SyntaxError: invalid syntax")
            } else {
                ExecutionResult {
                    success: true,
                    stdout: "{\"threats_detected\": 0}".to_string(),
                    stderr: String::new(),
                    findings: Some(serde_json::json!({"threats_detected": 0})),
                    error: None,
                    duration_ms: 5,
                }
            }
        }
    }

    fn analysis_request() -> GenerationRequest {
        GenerationRequest {
            id: "r-1".to_string(),
            kind: RequestKind::Analysis,
            notifications: vec![],
            tools: vec![],
            prior: None,
            passages: vec![],
            metric_before: MetricState::default(),
            regen: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    const CODE_RESPONSE: &str = "```python\nimport json\nprint(json.dumps({'ok': 1}))\n```";

    #[tokio::test]
    async fn test_first_attempt_success_stops_early() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Ok(CODE_RESPONSE.to_string())]));
        let sandbox = Arc::new(FlakySandbox {
            failures_left: Mutex::new(0),
        });
        let r#loop = RegenerationLoop::new(generator.clone(), sandbox);

        let outcome = r#loop.run(&analysis_request(), 3).await;
        assert!(outcome.result.success);
        assert!(!outcome.exhausted);
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(generator.call_count(), 1);
    }

    #[tokio::test]
    async fn test_errors_accumulate_into_regen_requests() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Ok(CODE_RESPONSE.to_string()),
            Ok(CODE_RESPONSE.to_string()),
        ]));
        let sandbox = Arc::new(FlakySandbox {
            failures_left: Mutex::new(1),
        });
        let r#loop = RegenerationLoop::new(generator, sandbox);

        let outcome = r#loop.run(&analysis_request(), 3).await;
        assert!(outcome.result.success);
        assert_eq!(outcome.attempts.len(), 2);
        assert!(!outcome.attempts[0].result.success);
        assert!(outcome.attempts[1].result.success);
    }

    #[tokio::test]
    async fn test_exhaustion_after_max_attempts() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Ok(CODE_RESPONSE.to_string()),
            Ok(CODE_RESPONSE.to_string()),
            Ok(CODE_RESPONSE.to_string()),
        ]));
        let sandbox = Arc::new(FlakySandbox {
            failures_left: Mutex::new(10),
        });
        let r#loop = RegenerationLoop::new(generator.clone(), sandbox);

        let outcome = r#loop.run(&analysis_request(), 3).await;
        assert!(!outcome.result.success);
        assert!(outcome.exhausted);
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(generator.call_count(), 3);
    }

    #[tokio::test]
    async fn test_generation_error_consumes_an_attempt() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Err(anyhow::anyhow!("inference 503")),
            Ok(CODE_RESPONSE.to_string()),
        ]));
        let sandbox = Arc::new(FlakySandbox {
            failures_left: Mutex::new(0),
        });
        let r#loop = RegenerationLoop::new(generator, sandbox);

        let outcome = r#loop.run(&analysis_request(), 3).await;
        assert!(outcome.result.success);
        assert_eq!(outcome.attempts.len(), 2);
        assert!(outcome.attempts[0]
            .result
            .error
            .as_ref()
            .unwrap()
            .contains("inference 503"));
    }

    #[tokio::test]
    async fn test_prose_response_consumes_an_attempt() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Ok("Here is an overview of the approach you could take to scan the chain."
                .to_string()),
            Ok(CODE_RESPONSE.to_string()),
        ]));
        let sandbox = Arc::new(FlakySandbox {
            failures_left: Mutex::new(0),
        });
        let r#loop = RegenerationLoop::new(generator, sandbox);

        let outcome = r#loop.run(&analysis_request(), 3).await;
        assert!(outcome.result.success);
        assert_eq!(outcome.attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_strategy_succeeds_on_plain_text() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Ok(
            "Rotate the approvals on the flagged wallet first.".to_string(),
        )]));
        let sandbox = Arc::new(FlakySandbox {
            failures_left: Mutex::new(10),
        });
        let r#loop = RegenerationLoop::new(generator, sandbox);

        let mut request = analysis_request();
        request.kind = RequestKind::Strategy;
        let outcome = r#loop.run(&request, 3).await;

        assert!(outcome.result.success);
        assert!(outcome.result.stdout.contains("Rotate the approvals"));
        assert_eq!(outcome.attempts.len(), 1);
    }
}
