//! Input normalisation and field rules shared by the resource handlers.
//!
//! Handlers bind loosely typed payloads (strings with serde defaults), run them
//! through a [`Checks`] collector and only then build typed `New*` records.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::models::Id;

pub type FieldErrors = BTreeMap<String, String>;

/// One rejected row of a bulk import.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BulkIssue {
    pub index: usize,
    pub fields: FieldErrors,
}

fn re(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(r) => r,
        Err(e) => panic!("invalid built-in pattern {pattern}: {e}"),
    }
}

pub static SCHOOL_CODE: Lazy<Regex> = Lazy::new(|| re(r"^[\p{Thai}A-Za-z0-9]{1,20}$"));
pub static SCHOOL_NAME: Lazy<Regex> = Lazy::new(|| re(r"^[\p{Thai}A-Za-z0-9\s]{1,100}$"));
pub static ADDRESS: Lazy<Regex> = Lazy::new(|| re(r"^[\p{Thai}A-Za-z0-9\s.,/\-]{1,255}$"));
pub static PHONE: Lazy<Regex> = Lazy::new(|| re(r"^[0-9\- ]{1,15}$"));
pub static NATIONAL_ID: Lazy<Regex> = Lazy::new(|| re(r"^[0-9]{1,13}$"));
pub static STUDENT_CODE: Lazy<Regex> = Lazy::new(|| re(r"^[A-Za-z0-9\-]{1,20}$"));
pub static TEACHER_CODE: Lazy<Regex> = Lazy::new(|| re(r"^[A-Za-z0-9]{1,20}$"));
pub static NAME_PREFIX: Lazy<Regex> = Lazy::new(|| re(r"^[\p{Thai}A-Za-z.]{1,20}$"));
pub static PERSON_NAME: Lazy<Regex> = Lazy::new(|| re(r"^[\p{Thai}A-Za-z\s]{1,50}$"));
pub static TEACHER_NAME: Lazy<Regex> = Lazy::new(|| re(r"^[\p{Thai}A-Za-z\- ]{1,50}$"));
pub static EMAIL: Lazy<Regex> = Lazy::new(|| re(r"^[^\s@]+@[^\s@]+\.[^\s@]+$"));
pub static STUDENT_ROOM: Lazy<Regex> = Lazy::new(|| re(r"^[0-9]{1,5}$"));
pub static HOMEROOM_ROOM: Lazy<Regex> = Lazy::new(|| re(r"^[0-9]{1,3}$"));
pub static YEAR: Lazy<Regex> = Lazy::new(|| re(r"^[0-9]{4}$"));
pub static HHMM: Lazy<Regex> = Lazy::new(|| re(r"^\d{2}:\d{2}$"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| re(r"\s+"));

/// Honorifics accepted for teachers.
pub const TEACHER_PREFIXES: &[&str] = &[
    "นาย", "นาง", "นางสาว", "ว่าที่ รต.", "ดร.", "Mr.", "Mrs.", "Ms.", "Dr.",
];

/// Trim and collapse internal whitespace runs to one space.
pub fn collapse_spaces(s: &str) -> String {
    WHITESPACE.replace_all(s.trim(), " ").into_owned()
}

pub fn digits_only(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

pub fn digit_count(s: &str) -> usize {
    s.chars().filter(|c| c.is_ascii_digit()).count()
}

/// Strict `YYYY-MM-DD`.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

/// Strict `HH:MM`.
pub fn parse_hhmm(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    if !HHMM.is_match(raw) {
        return None;
    }
    NaiveTime::parse_from_str(raw, "%H:%M").ok()
}

/// Picks `incoming` unless it is blank, in which case the stored value is kept.
pub fn keep_or(incoming: &str, stored: &str) -> String {
    if incoming.trim().is_empty() { stored.to_string() } else { incoming.to_string() }
}

/// Collects per-field messages; the first message for a field wins.
#[derive(Debug, Default)]
pub struct Checks {
    errs: FieldErrors,
}

impl Checks {
    pub fn new() -> Self { Self::default() }

    pub fn fail(&mut self, field: &str, message: &str) {
        self.errs.entry(field.to_string()).or_insert_with(|| message.to_string());
    }

    pub fn is_empty(&self) -> bool { self.errs.is_empty() }

    /// Non-blank check; returns whether it passed.
    pub fn required(&mut self, field: &str, value: &str) -> bool {
        if value.trim().is_empty() {
            self.fail(field, "required");
            false
        } else {
            true
        }
    }

    pub fn matches(&mut self, field: &str, value: &str, rule: &Regex, message: &str) -> bool {
        if !self.required(field, value) {
            return false;
        }
        if rule.is_match(value) {
            true
        } else {
            self.fail(field, message);
            false
        }
    }

    pub fn max_chars(&mut self, field: &str, value: &str, max: usize) -> bool {
        if value.chars().count() > max {
            self.fail(field, &format!("must be at most {max} characters"));
            false
        } else {
            true
        }
    }

    /// Parse a required enumeration value.
    pub fn choice<T: FromStr>(&mut self, field: &str, value: &str, allowed: &[&str]) -> Option<T> {
        if !self.required(field, value) {
            return None;
        }
        match value.trim().parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                self.fail(field, &format!("must be one of: {}", allowed.join(", ")));
                None
            }
        }
    }

    pub fn date(&mut self, field: &str, value: &str) -> Option<NaiveDate> {
        if !self.required(field, value) {
            return None;
        }
        let parsed = parse_date(value);
        if parsed.is_none() {
            self.fail(field, "must be a date in YYYY-MM-DD format");
        }
        parsed
    }

    /// Blank is allowed and yields `None`.
    pub fn optional_date(&mut self, field: &str, value: &str) -> Option<NaiveDate> {
        if value.trim().is_empty() {
            return None;
        }
        self.date(field, value)
    }

    pub fn time(&mut self, field: &str, value: &str) -> Option<NaiveTime> {
        if !self.required(field, value) {
            return None;
        }
        let parsed = parse_hhmm(value);
        if parsed.is_none() {
            self.fail(field, "must be a time in HH:MM format");
        }
        parsed
    }

    pub fn optional_time(&mut self, field: &str, value: &str) -> Option<NaiveTime> {
        if value.trim().is_empty() {
            return None;
        }
        self.time(field, value)
    }

    /// Phone number shape plus a 9 or 10 digit count.
    pub fn phone(&mut self, field: &str, value: &str) -> bool {
        if !self.matches(field, value, &PHONE, "may contain digits, spaces and hyphens only") {
            return false;
        }
        let n = digit_count(value);
        if !(9..=10).contains(&n) {
            self.fail(field, "must contain 9-10 digits");
            return false;
        }
        true
    }

    pub fn into_errors(self) -> FieldErrors { self.errs }

    pub fn finish(self) -> Result<(), ApiError> {
        if self.errs.is_empty() { Ok(()) } else { Err(ApiError::Validation(self.errs)) }
    }
}

/// `page` / `size` as received; malformed values fall back to defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageParams {
    #[serde(default)]
    pub page: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
}

impl PageParams {
    /// Returns `(page, size)` with page ≥ 1 and size clamped to `[1, max]`.
    pub fn resolve(&self, default_size: i64, max: i64) -> (i64, i64) {
        let page = self
            .page
            .as_deref()
            .and_then(|p| p.trim().parse::<i64>().ok())
            .filter(|p| *p >= 1)
            .unwrap_or(1);
        let size = self
            .size
            .as_deref()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .filter(|s| *s >= 1)
            .unwrap_or(default_size)
            .min(max);
        (page, size)
    }
}

/// Clamp a raw `limit` into `[1, max]`, defaulting when absent or malformed.
pub fn clamp_limit(raw: Option<&str>, default: i64, max: i64) -> i64 {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|v| *v >= 1)
        .unwrap_or(default)
        .min(max)
}

pub fn parse_offset(raw: Option<&str>) -> i64 {
    raw.and_then(|v| v.trim().parse::<i64>().ok()).filter(|v| *v >= 0).unwrap_or(0)
}

/// Id sent either as a JSON number or as a string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum LooseId {
    Number(i64),
    Text(String),
}

impl LooseId {
    /// Positive numeric id, if this value is one.
    pub fn as_id(&self) -> Option<Id> {
        match self {
            LooseId::Number(n) => Some(*n),
            LooseId::Text(t) => t.trim().parse::<Id>().ok(),
        }
        .filter(|id| *id > 0)
    }

    pub fn as_text(&self) -> String {
        match self {
            LooseId::Number(n) => n.to_string(),
            LooseId::Text(t) => t.trim().to_string(),
        }
    }
}

/// Free-text match used by the in-memory listings.
pub fn contains_ci(haystack: &str, needle_lower: &str) -> bool {
    haystack.to_lowercase().contains(needle_lower)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_collapsed_and_checked() {
        assert_eq!(collapse_spaces("  สมชาย   ใจดี "), "สมชาย ใจดี");
        assert!(PERSON_NAME.is_match("Somchai"));
        assert!(PERSON_NAME.is_match("สมชาย"));
        assert!(!PERSON_NAME.is_match("R2D2"));
    }

    #[test]
    fn phone_needs_nine_or_ten_digits() {
        let mut c = Checks::new();
        assert!(c.phone("phone", "081-234-5678"));
        assert!(!c.phone("short", "12345"));
        assert!(!c.phone("letters", "08x1234567"));
        let errs = c.into_errors();
        assert_eq!(errs["short"], "must contain 9-10 digits");
        assert!(errs.contains_key("letters"));
    }

    #[test]
    fn dates_and_times_are_strict() {
        assert!(parse_date("2024-05-17").is_some());
        assert!(parse_date("2024-5-17").is_none());
        assert!(parse_date("2024-02-30").is_none());
        assert!(parse_hhmm("07:45").is_some());
        assert!(parse_hhmm("7:45").is_none());
        assert!(parse_hhmm("25:00").is_none());
    }

    #[test]
    fn paging_is_clamped() {
        let p = PageParams { page: Some("0".into()), size: Some("500".into()) };
        assert_eq!(p.resolve(20, 100), (1, 100));
        let p = PageParams { page: Some("x".into()), size: None };
        assert_eq!(p.resolve(10, 100), (1, 10));
        assert_eq!(clamp_limit(Some("-3"), 20, 100), 20);
        assert_eq!(clamp_limit(Some("5000"), 200, 1000), 1000);
        assert_eq!(parse_offset(Some("-1")), 0);
    }

    #[test]
    fn loose_ids_accept_numbers_and_strings() {
        let n: LooseId = serde_json::from_str("12").unwrap();
        let s: LooseId = serde_json::from_str("\" 12 \"").unwrap();
        let code: LooseId = serde_json::from_str("\"T001\"").unwrap();
        assert_eq!(n.as_id(), Some(12));
        assert_eq!(s.as_id(), Some(12));
        assert_eq!(code.as_id(), None);
        assert_eq!(code.as_text(), "T001");
    }

    #[test]
    fn first_message_per_field_wins() {
        let mut c = Checks::new();
        c.fail("grade", "required");
        c.fail("grade", "other");
        assert_eq!(c.into_errors()["grade"], "required");
    }
}
