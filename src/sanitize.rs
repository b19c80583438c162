//! Text clean-up applied to user-supplied strings before storage.
use once_cell::sync::Lazy;
use regex::Regex;

static TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<\s*(script|style)[^>]*>.*?<\s*/\s*(script|style)\s*>|<[^>]*>")
        .expect("valid tag regex")
});

/// Remove HTML tags; `<script>`/`<style>` blocks are dropped with their content.
pub fn strip_html(input: &str) -> String {
    TAG_RE.replace_all(input, "").into_owned()
}

/// Strip tags and control characters (keeping newlines and tabs), then trim.
pub fn sanitize_text(input: &str) -> String {
    strip_html(input)
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}

pub fn sanitize_opt(input: Option<&str>) -> Option<String> {
    input.map(sanitize_text).filter(|s| !s.is_empty())
}

pub fn normalize_email(input: &str) -> String {
    input.trim().to_lowercase()
}
