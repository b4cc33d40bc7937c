//! Response envelope: the only result shape that leaves the pipeline.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::command::{CallMetrics, FinalizedCommand};
use crate::extract::Reduction;

/// Overall outcome, derived from answer emptiness alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Partial,
    Error,
}

impl Status {
    /// `error` iff every answer is empty (and there is at least one);
    /// `partial` iff some but not all are empty; `ok` otherwise. Only the
    /// empty string counts as empty.
    pub fn from_answers(answers: &[String]) -> Self {
        let empty = answers.iter().filter(|a| a.is_empty()).count();
        match (empty, answers.len()) {
            (0, _) => Status::Ok,
            (e, k) if e == k => Status::Error,
            _ => Status::Partial,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Partial => "partial",
            Status::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvelopeMetrics {
    /// Per-stage durations, `{stage}_ms`.
    pub durations: BTreeMap<String, u64>,
    pub per_call: Vec<CallMetrics>,
    pub cache_used: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseEnvelope {
    pub status: Status,
    pub answers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<Vec<Value>>,
    pub usage: BTreeMap<String, u64>,
    pub metrics: EnvelopeMetrics,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Value>,
}

impl ResponseEnvelope {
    /// Terminal construction from the finalized command and its reduction.
    pub(crate) fn build(finalized: FinalizedCommand, reduction: Reduction) -> Self {
        let FinalizedCommand {
            invocation,
            telemetry,
            ..
        } = finalized;

        let mut durations = telemetry.durations;
        durations.insert("rate_limit_wait_ms".to_string(), telemetry.rate_limit_wait_ms);

        let mut diagnostics = telemetry.diagnostics;
        diagnostics.extend(invocation.diagnostics);
        diagnostics.extend(reduction.diagnostics);

        Self {
            status: Status::from_answers(&reduction.answers),
            answers: reduction.answers,
            structured: reduction.structured,
            usage: invocation.usage,
            metrics: EnvelopeMetrics {
                durations,
                per_call: invocation.per_call,
                cache_used: telemetry.cache_used,
            },
            diagnostics,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answers(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn status_law() {
        assert_eq!(Status::from_answers(&[]), Status::Ok);
        assert_eq!(Status::from_answers(&answers(&["a", "b"])), Status::Ok);
        assert_eq!(Status::from_answers(&answers(&["a", ""])), Status::Partial);
        assert_eq!(Status::from_answers(&answers(&["", ""])), Status::Error);
        assert_eq!(Status::from_answers(&answers(&["a", " "])), Status::Ok);
        assert_eq!(Status::from_answers(&answers(&["", "  "])), Status::Partial);
        assert_eq!(Status::from_answers(&answers(&[""])), Status::Error);
    }

    #[test]
    fn serialized_shape_omits_empty_optionals() {
        let envelope = ResponseEnvelope {
            status: Status::Partial,
            answers: answers(&["x", ""]),
            structured: None,
            usage: BTreeMap::from([("total_tokens".to_string(), 12)]),
            metrics: EnvelopeMetrics {
                durations: BTreeMap::new(),
                per_call: Vec::new(),
                cache_used: false,
            },
            diagnostics: Vec::new(),
        };
        let json = envelope.to_json();
        assert_eq!(json["status"], "partial");
        assert_eq!(json["usage"]["total_tokens"], 12);
        assert!(json.get("structured").is_none());
        assert!(json.get("diagnostics").is_none());
        assert_eq!(json["metrics"]["cache_used"], false);
    }
}
