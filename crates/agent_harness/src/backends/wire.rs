//! Value-walking helpers shared by the backend normalizers: stop-reason and
//! usage field-name synonym tables, plus tolerant string/number extraction.

use harness_events::{SessionStatus, UsageTotals};
use serde_json::Value;

pub(crate) fn extract_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub(crate) fn extract_str_from_keys<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| extract_str(value, key))
}

pub(crate) fn extract_u64_from_keys(value: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| value.get(key)?.as_u64())
}

pub(crate) fn extract_f64_from_keys(value: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| value.get(key)?.as_f64())
}

/// Maps a producer-reported stop reason to a terminal status.
///
/// Synonym table; unknown and absent reasons default to `success` (producers
/// that mean failure say so explicitly).
pub(crate) fn map_stop_reason(reason: Option<&str>) -> SessionStatus {
    let Some(reason) = reason else {
        return SessionStatus::Success;
    };
    match reason.to_ascii_lowercase().as_str() {
        "success" | "completed" | "ok" => SessionStatus::Success,
        "interrupted" | "cancelled" | "aborted" => SessionStatus::Interrupted,
        "max_turns" | "maxturns" => SessionStatus::MaxTurns,
        "max_budget" | "budget_exceeded" => SessionStatus::MaxBudget,
        "error" | "failed" => SessionStatus::Error,
        _ => SessionStatus::Success,
    }
}

/// Pulls usage totals out of a terminal message, tolerating the field-name
/// variants the backends actually emit. Looks inside a nested `usage` object
/// first, then at the value itself.
pub(crate) fn usage_from_value(value: &Value) -> UsageTotals {
    let scope = value.get("usage").unwrap_or(value);
    UsageTotals {
        input_tokens: extract_u64_from_keys(scope, &["input_tokens", "inputTokens", "input"])
            .unwrap_or(0),
        output_tokens: extract_u64_from_keys(scope, &["output_tokens", "outputTokens", "output"])
            .unwrap_or(0),
        tool_uses: extract_u64_from_keys(scope, &["tool_uses", "toolUses", "tool_calls"])
            .unwrap_or(0),
        total_cost_usd: extract_f64_from_keys(
            value,
            &["total_cost_usd", "totalCostUsd", "total_cost", "cost"],
        )
        .or_else(|| {
            extract_f64_from_keys(scope, &["total_cost_usd", "totalCostUsd", "total_cost", "cost"])
        }),
    }
}
