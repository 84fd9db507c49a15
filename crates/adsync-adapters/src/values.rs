//! Lenient readers for report cells. Networks disagree on whether counters
//! arrive as JSON numbers or strings, so every reader accepts both.

use serde_json::Value as JsonValue;

const MICROS_PER_UNIT: i64 = 1_000_000;

/// Parses a decimal money amount into micros without going through floats.
/// Digits past the sixth decimal are rounded half away from zero.
pub fn parse_money_micros(raw: &str) -> Option<i64> {
    let text = raw.trim().replace(',', "");
    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(&text)),
    };
    let (whole, fraction) = match unsigned.split_once('.') {
        Some((w, f)) => (w, f),
        None => (unsigned, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }

    let whole_units = if whole.is_empty() {
        0
    } else {
        whole.parse::<i64>().ok()?
    };
    let mut micros = whole_units.checked_mul(MICROS_PER_UNIT)?;

    let kept = &fraction[..fraction.len().min(6)];
    if !kept.is_empty() {
        let scale = 10i64.pow(6 - kept.len() as u32);
        micros = micros.checked_add(kept.parse::<i64>().ok()? * scale)?;
    }
    if fraction.as_bytes().get(6).is_some_and(|d| *d >= b'5') {
        micros = micros.checked_add(1)?;
    }

    Some(if negative { -micros } else { micros })
}

/// Text rendering of a scalar cell; `None` for null, objects and arrays.
pub fn cell_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn int_cell(value: Option<&JsonValue>, field: &str) -> Result<i64, String> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(0);
    };
    if let Some(n) = value.as_i64() {
        return Ok(n);
    }
    cell_text(value)
        .and_then(|s| s.replace(',', "").parse::<i64>().ok())
        .ok_or_else(|| format!("{field}: expected an integer, got {value}"))
}

pub fn float_cell(value: Option<&JsonValue>, field: &str) -> Result<f64, String> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(0.0);
    };
    if let Some(n) = value.as_f64() {
        return Ok(n);
    }
    cell_text(value)
        .and_then(|s| s.replace(',', "").parse::<f64>().ok())
        .ok_or_else(|| format!("{field}: expected a number, got {value}"))
}

pub fn money_cell(value: Option<&JsonValue>, field: &str) -> Result<i64, String> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(0);
    };
    cell_text(value)
        .and_then(|s| parse_money_micros(&s))
        .ok_or_else(|| format!("{field}: expected a money amount, got {value}"))
}

pub fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}
