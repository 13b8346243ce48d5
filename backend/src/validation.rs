use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static EMAIL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email pattern"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("`{0}` is required")]
    Required(&'static str),
    #[error("`{0}` is not a valid email address")]
    Email(&'static str),
    #[error("`{0}` is not a valid phone number")]
    Phone(&'static str),
    #[error("`{0}` must not be in the past")]
    PastDate(&'static str),
    #[error("`{field}` is out of range: {reason}")]
    Range { field: &'static str, reason: String },
}

/// Trims `value` and rejects it when empty.
pub fn required<'a>(field: &'static str, value: &'a str) -> Result<&'a str, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Required(field));
    }
    Ok(trimmed)
}

pub fn email(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if EMAIL_PATTERN.is_match(value.trim()) {
        Ok(())
    } else {
        Err(ValidationError::Email(field))
    }
}

/// Accepts North American numbers: ten digits, optionally prefixed by a `1`
/// country code, with any punctuation in between.
pub fn phone(field: &'static str, value: &str) -> Result<(), ValidationError> {
    let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
    let allowed = value
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, ' ' | '-' | '(' | ')' | '.' | '+'));
    let valid = allowed
        && match digits.len() {
            10 => true,
            11 => digits.starts_with('1'),
            _ => false,
        };
    if valid {
        Ok(())
    } else {
        Err(ValidationError::Phone(field))
    }
}

pub fn optional_phone(field: &'static str, value: Option<&str>) -> Result<(), ValidationError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) => phone(field, value),
        None => Ok(()),
    }
}

pub fn not_in_past(
    field: &'static str,
    date: NaiveDate,
    today: NaiveDate,
) -> Result<(), ValidationError> {
    if date < today {
        Err(ValidationError::PastDate(field))
    } else {
        Ok(())
    }
}

pub fn coordinates(latitude: f64, longitude: f64) -> Result<(), ValidationError> {
    if !(-90.0..=90.0).contains(&latitude) {
        return Err(ValidationError::Range {
            field: "latitude",
            reason: format!("{latitude} not within -90..=90"),
        });
    }
    if !(-180.0..=180.0).contains(&longitude) {
        return Err(ValidationError::Range {
            field: "longitude",
            reason: format!("{longitude} not within -180..=180"),
        });
    }
    Ok(())
}
