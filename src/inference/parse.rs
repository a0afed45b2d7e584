//! Turns raw reviewer output into an [`InferenceDecision`].
//!
//! Accepted shapes, tried in order:
//! * a JSON object with `decision`, `reasoning`/`reason`, `confidence`, `risk_factors`
//! * a JSON wrapper whose `result` string holds one of these shapes
//! * a JSON object embedded in surrounding prose
//! * free text lines `DECISION:`, `REASON:`, `CONFIDENCE:`, `RISK_FACTORS:`

use serde_json::{Map, Value};

use super::InferenceDecision;
use crate::domain::Verdict;
use crate::error::GateError;

/// Confidence assumed when the reviewer gives none.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

const MAX_REASONING_LEN: usize = 2000;
const MAX_WRAPPER_DEPTH: usize = 2;

pub fn parse_review(output: &str, provider: &str) -> Result<InferenceDecision, GateError> {
    parse_at_depth(output, provider, 0)
}

fn parse_at_depth(output: &str, provider: &str, depth: usize) -> Result<InferenceDecision, GateError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(GateError::InvalidAiResponse("empty reviewer output".to_string()));
    }

    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(trimmed) {
        return from_object(&obj, provider, depth);
    }

    if let Some(obj) = embedded_object(trimmed) {
        if let Ok(decision) = from_object(&obj, provider, depth) {
            return Ok(decision);
        }
    }

    from_text(trimmed, provider)
}

fn from_object(obj: &Map<String, Value>, provider: &str, depth: usize) -> Result<InferenceDecision, GateError> {
    if !obj.contains_key("decision") && depth < MAX_WRAPPER_DEPTH {
        if let Some(inner) = obj.get("result").and_then(Value::as_str) {
            return parse_at_depth(inner, provider, depth + 1);
        }
    }

    let raw = obj
        .get("decision")
        .or_else(|| obj.get("action"))
        .and_then(Value::as_str)
        .ok_or_else(|| GateError::InvalidAiResponse("response has no decision field".to_string()))?;
    let decision = Verdict::parse(raw)
        .ok_or_else(|| GateError::InvalidAiResponse(format!("unknown decision '{}'", raw)))?;

    let reasoning = obj
        .get("reasoning")
        .or_else(|| obj.get("reason"))
        .and_then(Value::as_str)
        .unwrap_or("");

    let confidence = match obj.get("confidence") {
        Some(Value::Number(n)) => n.as_f64().map(normalize_confidence).unwrap_or(DEFAULT_CONFIDENCE),
        Some(Value::String(s)) => parse_confidence(s).unwrap_or(DEFAULT_CONFIDENCE),
        _ => DEFAULT_CONFIDENCE,
    };

    let risk_factors = match obj.get("risk_factors") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => split_list(s),
        _ => Vec::new(),
    };

    let model = obj.get("model").and_then(Value::as_str).map(str::to_string);

    Ok(InferenceDecision::new(decision, truncate(reasoning), confidence, provider)
        .with_model(model)
        .with_risk_factors(risk_factors))
}

fn embedded_object(text: &str) -> Option<Map<String, Value>> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(Value::Object(obj)) => Some(obj),
        _ => None,
    }
}

fn from_text(text: &str, provider: &str) -> Result<InferenceDecision, GateError> {
    let mut decision = None;
    let mut reasoning = String::new();
    let mut confidence = DEFAULT_CONFIDENCE;
    let mut risk_factors = Vec::new();

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().trim_matches('*').trim();
        match key.trim().trim_start_matches(['*', '#', '-', ' ']).to_uppercase().as_str() {
            "DECISION" => decision = Verdict::parse(value.trim_matches(['*', '.', '"'])),
            "REASON" | "REASONING" => reasoning = value.to_string(),
            "CONFIDENCE" => confidence = parse_confidence(value).unwrap_or(DEFAULT_CONFIDENCE),
            "RISK_FACTORS" | "RISK FACTORS" => risk_factors = split_list(value),
            _ => {}
        }
    }

    let decision = decision.ok_or_else(|| {
        GateError::InvalidAiResponse("reviewer output has no recognisable DECISION".to_string())
    })?;

    Ok(InferenceDecision::new(decision, truncate(&reasoning), confidence, provider)
        .with_risk_factors(risk_factors))
}

/// Accepts `0.8`, `80%` and `80` (read as a percentage).
fn parse_confidence(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if let Some(pct) = raw.strip_suffix('%') {
        return pct.trim().parse::<f64>().ok().map(|p| p / 100.0);
    }
    raw.parse::<f64>().ok().map(normalize_confidence)
}

fn normalize_confidence(value: f64) -> f64 {
    if value > 1.0 && value <= 100.0 {
        value / 100.0
    } else {
        value
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.trim_matches(['[', ']'])
        .split(',')
        .map(|s| s.trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("none"))
        .collect()
}

fn truncate(reasoning: &str) -> String {
    reasoning.trim().chars().take(MAX_REASONING_LEN).collect()
}
