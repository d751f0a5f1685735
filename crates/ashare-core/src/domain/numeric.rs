//! Lenient numeric coercion for upstream payload values.
//!
//! Providers send numbers as JSON numbers, as strings with thousands
//! separators, or as placeholders (`null`, `""`, `"-"`) for suspended
//! instruments. Every placeholder coerces to zero.

use serde_json::Value;

pub fn coerce_f64(value: &Value) -> f64 {
    let parsed = match value {
        Value::Number(number) => number.as_f64().unwrap_or(0.0),
        Value::String(text) => coerce_str(text),
        _ => 0.0,
    };
    finite_or_zero(parsed)
}

pub fn coerce_str(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.chars().all(|ch| ch == '-') {
        return 0.0;
    }

    let cleaned: String = trimmed
        .chars()
        .filter(|ch| *ch != ',' && *ch != '%')
        .collect();
    finite_or_zero(cleaned.parse::<f64>().unwrap_or(0.0))
}

pub fn coerce_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.trim().to_owned(),
        Value::Number(number) => number.to_string(),
        _ => String::new(),
    }
}

pub fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}
