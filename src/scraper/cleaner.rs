//! Field-level cleaning shared by every source: placeholder tokens, numbers
//! with thousands separators, and the `<n>時` hour labels.

/// Tokens utilities print where a figure is not available.
pub const DEFAULT_PLACEHOLDERS: &[&str] = &["|", "-", "－", "—", "―", "‐", "N/A", "NaN", "nan"];

/// Trim a raw field and map empty cells and placeholders to `None`.
pub fn clean_field(raw: &str, placeholders: &[String]) -> Option<String> {
    let s = raw.trim().trim_matches('"').trim();
    if s.is_empty() || placeholders.iter().any(|p| p == s) {
        return None;
    }
    Some(s.to_string())
}

/// Parse a measured value: "1,234.5" → 1234.5 | " 42 " → 42.0 | "１，２３４" → 1234.0
///
/// Returns `None` when the field is not numeric at all; callers decide
/// whether that is a missing value or a warning.
pub fn parse_quantity(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let cleaned: String = s
        .chars()
        .map(to_ascii_numeral)
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    let value: f64 = cleaned.parse().ok()?;
    value.is_finite().then_some(value)
}

/// Full-width digits, separators and signs as their ASCII forms.
fn to_ascii_numeral(c: char) -> char {
    match c {
        '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32).unwrap_or(c),
        '，' => ',',
        '．' => '.',
        '－' | '−' => '-',
        _ => c,
    }
}

/// Rewrite an hour label such as "9時" into "09:00".
///
/// Returns the hour as well so callers can handle the `24時` end-of-day label.
pub fn rewrite_hour_label(s: &str) -> Option<(u32, String)> {
    let digits = s.trim().strip_suffix('時')?.trim();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hour: u32 = digits.parse().ok()?;
    if hour > 24 {
        return None;
    }
    Some((hour, format!("{:02}:00", hour)))
}
