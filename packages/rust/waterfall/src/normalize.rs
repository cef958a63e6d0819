//! Fact-specific normalizers and the shared missing-value predicate.
//!
//! A normalizer maps a raw provider field to a typed [`FactValue`], or `None`
//! when the field cannot yield a value and the waterfall should move on.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, NaiveDate};
use dealflow_shared::{DealflowError, FactValue, Result, is_missing_text};
use regex::Regex;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Regex patterns (compiled once)
// ---------------------------------------------------------------------------

static FIRST_INT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("first integer regex"));

static LEADING_YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d{4})\b").expect("leading year regex"));

static MONEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\$?\s*([0-9][0-9,]*(?:\.[0-9]+)?)\s*([kmb])?\s*(?:usd)?$").expect("money regex")
});

// ---------------------------------------------------------------------------
// Missing values & path lookup
// ---------------------------------------------------------------------------

/// True for an absent field, JSON `null`, and blank / "not found" /
/// "not listed" strings (case and surrounding whitespace ignored).
///
/// Numbers, including zero, are never missing.
pub fn is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => is_missing_text(s),
        Some(_) => false,
    }
}

/// Look up a dotted path (`"linkedin.employee_count"`, `"rounds.0.amount"`).
///
/// Absent segments yield `Ok(None)`; numeric segments index arrays. A path
/// with an empty segment is a caller bug and returns `Err`.
pub fn get_nested_value<'a>(obj: &'a Value, path: &str) -> Result<Option<&'a Value>> {
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(DealflowError::validation(format!(
            "malformed source path '{path}'"
        )));
    }

    let mut current = obj;
    for segment in path.split('.') {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

// ---------------------------------------------------------------------------
// Normalizers
// ---------------------------------------------------------------------------

/// How a raw field becomes a [`FactValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalizer {
    /// Number, numeric string, or range string (first integer wins).
    /// Anything unparseable becomes `0`.
    EmployeeCount,
    /// Year number or a date string; unparseable is a miss.
    Year,
    /// Strings only, no coercion.
    Text,
    /// Dollar amounts such as `12500000`, `"$12.5M"`, `"1,200,000"`.
    Money,
}

impl Normalizer {
    pub fn apply(self, raw: &Value) -> Option<FactValue> {
        match self {
            Self::EmployeeCount => Some(FactValue::Integer(employee_count(raw))),
            Self::Year => year(raw).map(FactValue::Integer),
            Self::Text => raw.as_str().map(|s| FactValue::Text(s.trim().to_string())),
            Self::Money => money(raw).map(FactValue::Integer),
        }
    }
}

fn employee_count(raw: &Value) -> i64 {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().unwrap_or_else(|| {
                FIRST_INT_RE
                    .find(s)
                    .and_then(|m| m.as_str().parse::<i64>().ok())
                    .unwrap_or(0)
            })
        }
        _ => 0,
    }
}

fn year(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Value::String(s) => year_from_str(s.trim()),
        _ => None,
    }
}

fn year_from_str(s: &str) -> Option<i64> {
    if s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse::<i64>().ok();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(i64::from(dt.year()));
    }
    for fmt in ["%Y-%m-%d", "%Y/%m/%d", "%B %d, %Y", "%b %d, %Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(i64::from(d.year()));
        }
    }
    LEADING_YEAR_RE
        .captures(s)
        .and_then(|c| c[1].parse::<i64>().ok())
}

fn money(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64)),
        Value::String(s) => {
            let caps = MONEY_RE.captures(s.trim())?;
            let amount: f64 = caps[1].replace(',', "").parse().ok()?;
            let scale = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
                Some(ref u) if u == "k" => 1e3,
                Some(ref u) if u == "m" => 1e6,
                Some(ref u) if u == "b" => 1e9,
                _ => 1.0,
            };
            Some((amount * scale).round() as i64)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn missing_boundary_cases() {
        assert!(is_missing(None));
        assert!(is_missing(Some(&Value::Null)));
        assert!(is_missing(Some(&json!(""))));
        assert!(is_missing(Some(&json!("Not Found"))));
        assert!(is_missing(Some(&json!("  not listed  "))));
        assert!(!is_missing(Some(&json!(0))));
        assert!(!is_missing(Some(&json!("0"))));
        assert!(!is_missing(Some(&json!(false))));
    }

    #[test]
    fn nested_lookup() {
        let payload = json!({
            "linkedin": {"employee_count": 42},
            "rounds": [{"amount": 5}, {"amount": 7}],
        });
        assert_eq!(
            get_nested_value(&payload, "linkedin.employee_count").unwrap(),
            Some(&json!(42))
        );
        assert_eq!(get_nested_value(&payload, "rounds.1.amount").unwrap(), Some(&json!(7)));
        assert_eq!(get_nested_value(&payload, "crunchbase.num_employees").unwrap(), None);
        assert_eq!(get_nested_value(&payload, "linkedin.employee_count.x").unwrap(), None);
        assert_eq!(get_nested_value(&payload, "rounds.9.amount").unwrap(), None);
    }

    #[test]
    fn nested_lookup_rejects_malformed_paths() {
        let payload = json!({});
        assert!(get_nested_value(&payload, "").is_err());
        assert!(get_nested_value(&payload, "a..b").is_err());
        assert!(get_nested_value(&payload, ".a").is_err());
    }

    #[test]
    fn employee_count_forms() {
        let n = Normalizer::EmployeeCount;
        assert_eq!(n.apply(&json!(120)), Some(FactValue::Integer(120)));
        assert_eq!(n.apply(&json!("250")), Some(FactValue::Integer(250)));
        assert_eq!(n.apply(&json!("11-50")), Some(FactValue::Integer(11)));
        assert_eq!(n.apply(&json!("1001-5000 employees")), Some(FactValue::Integer(1001)));
        assert_eq!(n.apply(&json!("abc")), Some(FactValue::Integer(0)));
    }

    #[test]
    fn year_forms() {
        let n = Normalizer::Year;
        assert_eq!(n.apply(&json!(2015)), Some(FactValue::Integer(2015)));
        assert_eq!(n.apply(&json!("2019-03-01")), Some(FactValue::Integer(2019)));
        assert_eq!(n.apply(&json!("2021")), Some(FactValue::Integer(2021)));
        assert_eq!(
            n.apply(&json!("2018-06-30T12:00:00Z")),
            Some(FactValue::Integer(2018))
        );
        assert_eq!(n.apply(&json!("March 15, 2017")), Some(FactValue::Integer(2017)));
        assert_eq!(n.apply(&json!("unknown")), None);
        assert_eq!(n.apply(&json!("-123")), None);
        assert_eq!(n.apply(&json!("+202")), None);
        assert_eq!(n.apply(&json!({"year": 2019})), None);
    }

    #[test]
    fn text_accepts_only_strings() {
        let n = Normalizer::Text;
        assert_eq!(n.apply(&json!(" SaaS ")), Some(FactValue::Text("SaaS".into())));
        assert_eq!(n.apply(&json!(3)), None);
        assert_eq!(n.apply(&json!(["SaaS"])), None);
    }

    #[test]
    fn money_forms() {
        let n = Normalizer::Money;
        assert_eq!(n.apply(&json!(12_500_000)), Some(FactValue::Integer(12_500_000)));
        assert_eq!(n.apply(&json!("$12.5M")), Some(FactValue::Integer(12_500_000)));
        assert_eq!(n.apply(&json!("1,200,000")), Some(FactValue::Integer(1_200_000)));
        assert_eq!(n.apply(&json!("3b USD")), Some(FactValue::Integer(3_000_000_000)));
        assert_eq!(n.apply(&json!("undisclosed")), None);
    }
}
