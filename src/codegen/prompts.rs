//! Prompt Builder
//!
//! Renders a [`GenerationRequest`] into the system and user messages sent
//! to the inference API. One builder covers every stage: the request kind
//! selects the task section, and a regeneration context swaps the task for
//! a repair instruction carrying the accumulated errors and failed code.

use crate::types::{GenerationRequest, Notification, Passage, RequestKind, ToolBinding};

pub const SYSTEM_PROMPT: &str = r#"You are a blockchain security sentinel. You monitor on-chain activity, detect threats, and protect the assets under your watch.

You write Python code that runs unattended in an isolated sandbox. Rules for generated code:
- Output a single complete program. No placeholders, no pseudo-code.
- Read credentials only from environment variables named in the tool list. Never hardcode secrets.
- Print progress to stdout. Print a final single-line JSON object summarizing results.
- Never take irreversible action beyond the quarantine operations you are asked to perform."#;

/// The task section, one per request kind.
fn task_section(kind: RequestKind) -> &'static str {
    match kind {
        RequestKind::AnalysisFirst => {
            "Task: this is your first observation of the environment. Write Python code that \
             surveys the monitored targets, establishes a security baseline, and reports what \
             you find. End by printing a JSON object with keys security_score (0.0-1.0), \
             threats_detected, and quarantined_items."
        }
        RequestKind::Analysis => {
            "Task: write Python code that investigates the notifications below, checks the \
             monitored targets for the threats they suggest, and reports findings. End by \
             printing a JSON object with keys security_score (0.0-1.0), threats_detected, and \
             quarantined_items."
        }
        RequestKind::Strategy => {
            "Task: based on the analysis results below, write a concrete defense strategy in \
             plain prose. State which threats to act on, in what order, and what to leave \
             alone. Respond with the strategy text only. Do not write code."
        }
        RequestKind::Quarantine => {
            "Task: write Python code that carries out the quarantine actions the strategy \
             below calls for, using only the listed tools. Log every action taken. End by \
             printing a JSON object with keys quarantined_items and threats_detected."
        }
    }
}

/// User message for a fresh (non-regeneration) request.
pub fn user_prompt(request: &GenerationRequest) -> String {
    if let Some(ref regen) = request.regen {
        return format!(
            "Your previous attempt failed. Errors accumulated so far:\n{}\n\n\
             The code that failed:\n```python\n{}\n```\n\n\
             Fix the problem and respond with the complete corrected output. \
             Do not repeat the failing approach.",
            regen.errors, regen.failed_code
        );
    }

    let mut sections: Vec<String> = Vec::new();

    sections.push(task_section(request.kind).to_string());

    sections.push(format!(
        "Current security metric: score {:.2}, {} threats detected, {} items quarantined \
         (observed {}).",
        request.metric_before.security_score,
        request.metric_before.threats_detected,
        request.metric_before.quarantined_items,
        request.metric_before.observed_at
    ));

    sections.push(render_notifications(&request.notifications));
    sections.push(render_tools(&request.tools));

    if let Some(ref prior) = request.prior {
        let label = match request.kind {
            RequestKind::Quarantine => "Strategy to execute",
            _ => "Previous cycle output",
        };
        sections.push(format!("{}:\n{}", label, prior));
    }

    if !request.passages.is_empty() {
        sections.push(render_passages(&request.passages));
    }

    sections.join("\n\n")
}

fn render_notifications(notifications: &[Notification]) -> String {
    if notifications.is_empty() {
        return "Notifications: none. Fresh environment.".to_string();
    }
    let lines: Vec<String> = notifications
        .iter()
        .map(|n| {
            format!(
                "- [{}] {} ({})",
                n.source.as_str(),
                n.summary,
                n.target.as_deref().unwrap_or("no target")
            )
        })
        .collect();
    format!("Notifications:\n{}", lines.join("\n"))
}

fn render_tools(tools: &[ToolBinding]) -> String {
    if tools.is_empty() {
        return "Available tools: none. Use only the Python standard library.".to_string();
    }
    let lines: Vec<String> = tools
        .iter()
        .map(|t| {
            let vars: Vec<&str> = t.env.keys().map(String::as_str).collect();
            format!("- {}: {} (env: {})", t.name, t.description, vars.join(", "))
        })
        .collect();
    format!("Available tools:\n{}", lines.join("\n"))
}

fn render_passages(passages: &[Passage]) -> String {
    let lines: Vec<String> = passages
        .iter()
        .map(|p| {
            format!(
                "- ({:.2}) {}{}",
                p.score,
                p.text,
                p.source
                    .as_deref()
                    .map(|s| format!(" [{}]", s))
                    .unwrap_or_default()
            )
        })
        .collect();
    format!("Threat intelligence:\n{}", lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MetricState, NotificationSource, RegenContext};

    fn base_request(kind: RequestKind) -> GenerationRequest {
        GenerationRequest {
            id: "r-1".to_string(),
            kind,
            notifications: vec![],
            tools: vec![],
            prior: None,
            passages: vec![],
            metric_before: MetricState::default(),
            regen: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn test_strategy_prompt_forbids_code() {
        let prompt = user_prompt(&base_request(RequestKind::Strategy));
        assert!(prompt.contains("Do not write code"));
    }

    #[test]
    fn test_regen_prompt_carries_errors_and_code() {
        let mut request = base_request(RequestKind::Analysis);
        request.regen = Some(RegenContext {
            attempt: 2,
            errors: "NameError: rpc is not defined".to_string(),
            failed_code: "print(rpc)".to_string(),
        });
        let prompt = user_prompt(&request);
        assert!(prompt.contains("NameError"));
        assert!(prompt.contains("print(rpc)"));
        assert!(!prompt.contains("Notifications:"));
    }

    #[test]
    fn test_empty_window_reads_as_fresh() {
        let prompt = user_prompt(&base_request(RequestKind::Analysis));
        assert!(prompt.contains("Fresh environment"));
    }

    #[test]
    fn test_notifications_and_passages_rendered() {
        let mut request = base_request(RequestKind::Analysis);
        request.notifications.push(Notification {
            id: "n-1".to_string(),
            source: NotificationSource::Market,
            target: Some("SOL".to_string()),
            summary: "price dropped 8.2%".to_string(),
            payload: serde_json::json!({}),
            created_at: chrono::Utc::now().to_rfc3339(),
            consumed_at: None,
        });
        request.passages.push(Passage {
            text: "Drainer contracts reuse approval patterns".to_string(),
            score: 0.91,
            source: Some("intel-db".to_string()),
        });
        let prompt = user_prompt(&request);
        assert!(prompt.contains("price dropped 8.2%"));
        assert!(prompt.contains("Drainer contracts"));
    }
}
