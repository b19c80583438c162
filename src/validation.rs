//! Input validation for API payloads.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::sanitize::sanitize_text;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 10_000;
pub const MAX_COMMENT_LEN: usize = 5_000;
pub const MAX_ACTIVE_LIMIT: i64 = 100;
pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 100;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}$")
        .expect("valid email regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Collects field errors while a payload is checked.
#[derive(Debug, Default)]
pub struct Validator {
    errors: Vec<FieldError>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, field: &str, message: impl Into<String>) -> &mut Self {
        self.errors.push(FieldError::new(field, message));
        self
    }

    /// Text checks run on the sanitized form, which is what gets stored.
    pub fn required_text(&mut self, field: &str, value: &str, max: usize) -> &mut Self {
        let clean = sanitize_text(value);
        if clean.is_empty() {
            self.error(field, "is required");
        } else if clean.chars().count() > max {
            self.error(field, format!("must be at most {max} characters"));
        }
        self
    }

    pub fn optional_text(&mut self, field: &str, value: Option<&str>, max: usize) -> &mut Self {
        if let Some(v) = value {
            if sanitize_text(v).chars().count() > max {
                self.error(field, format!("must be at most {max} characters"));
            }
        }
        self
    }

    /// Present-but-blank is rejected; absent is fine.
    pub fn non_blank_if_present(&mut self, field: &str, value: Option<&str>, max: usize) -> &mut Self {
        if let Some(v) = value {
            self.required_text(field, v, max);
        }
        self
    }

    pub fn email(&mut self, field: &str, value: &str) -> &mut Self {
        if !is_valid_email(value) {
            self.error(field, "must be a valid email address");
        }
        self
    }

    pub fn range(&mut self, field: &str, value: i64, min: i64, max: i64) -> &mut Self {
        if value < min || value > max {
            self.error(field, format!("must be between {min} and {max}"));
        }
        self
    }

    pub fn finish(&mut self) -> Result<(), ApiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ApiError::Validation {
                message: "invalid input".into(),
                fields: std::mem::take(&mut self.errors),
            })
        }
    }
}

/// Implemented by request payloads that must be checked before use.
pub trait Validate {
    fn validate(&self) -> Result<(), ApiError>;
}

pub fn is_valid_email(value: &str) -> bool {
    let v = value.trim();
    v.len() <= 254 && EMAIL_RE.is_match(v)
}

/// `?limit=&offset=` query parameters.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Pagination {
    /// Returns `(limit, offset)` with defaults applied.
    pub fn resolve(&self) -> Result<(i64, i64), ApiError> {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        let offset = self.offset.unwrap_or(0);
        let mut v = Validator::new();
        v.range("limit", limit, 1, MAX_PAGE_SIZE);
        if offset < 0 {
            v.error("offset", "must be >= 0");
        }
        v.finish()?;
        Ok((limit, offset))
    }
}
