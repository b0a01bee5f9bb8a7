/// Output Sanitization Module
///
/// Sanitization of fetched rows.
///
/// Text values are passed through a `Sanitizer` before they leave the facade.
/// The default `HtmlEscaper` escapes the five HTML special characters. Only
/// text is touched: integers, reals and nulls render the same escaped or not,
/// and blobs are left as raw bytes.

use crate::core::db::row::{Fetched, Row};
use rusqlite::types::Value;
use thiserror::Error;
use tracing::debug;

/// A sanitizer refused one value. The value is kept as fetched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("sanitizer rejected value: {0}")]
pub struct SanitizeError(pub String);

/// Escapes one text value.
pub trait Sanitizer: Send + Sync {
    fn escape(&self, raw: &str) -> Result<String, SanitizeError>;
}

impl<F> Sanitizer for F
where
    F: Fn(&str) -> Result<String, SanitizeError> + Send + Sync,
{
    fn escape(&self, raw: &str) -> Result<String, SanitizeError> {
        self(raw)
    }
}

/// HTML special-character escaping, single and double quotes included.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlEscaper;

impl Sanitizer for HtmlEscaper {
    fn escape(&self, raw: &str) -> Result<String, SanitizeError> {
        Ok(escape_html(raw))
    }
}

pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#039;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Escapes a single value in place. Failures leave the value untouched.
pub fn sanitize_value(sanitizer: &dyn Sanitizer, value: &mut Value) {
    if let Value::Text(text) = value {
        match sanitizer.escape(text) {
            Ok(escaped) => *text = escaped,
            Err(e) => debug!("Skipping value the sanitizer rejected: {}", e),
        }
    }
}

/// Flat sanitizer: every value of one row.
pub fn sanitize_values(sanitizer: &dyn Sanitizer, values: &mut [Value]) {
    for value in values.iter_mut() {
        sanitize_value(sanitizer, value);
    }
}

pub fn sanitize_row(sanitizer: &dyn Sanitizer, row: &mut Row) {
    sanitize_values(sanitizer, row.values_mut());
}

/// Sanitizes a fetched unit if it is a row. Records and scalars pass through.
pub fn sanitize_fetched(sanitizer: &dyn Sanitizer, fetched: &mut Fetched) {
    match fetched {
        Fetched::Row(row) => sanitize_row(sanitizer, row),
        Fetched::Values(values) => sanitize_values(sanitizer, values),
        Fetched::Record(_) | Fetched::Scalar(_) => {}
    }
}

/// Two-level sanitizer: each row of a result set, each value of a row.
pub fn sanitize_set(sanitizer: &dyn Sanitizer, set: &mut [Fetched]) {
    for fetched in set.iter_mut() {
        sanitize_fetched(sanitizer, fetched);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Row {
        Row::new(
            pairs.iter().map(|(c, _)| c.to_string()).collect(),
            pairs.iter().map(|(_, v)| v.clone()).collect(),
        )
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<b>x</b>"), "&lt;b&gt;x&lt;/b&gt;");
        assert_eq!(escape_html(r#"Tom & "Jerry's""#), "Tom &amp; &quot;Jerry&#039;s&quot;");
        assert_eq!(escape_html("plain"), "plain");
    }

    #[test]
    fn test_sanitize_row_only_touches_text() {
        let mut r = row(&[
            ("a", Value::Text("<b>x</b>".to_string())),
            ("n", Value::Integer(5)),
            ("blob", Value::Blob(b"<raw>".to_vec())),
            ("none", Value::Null),
        ]);
        sanitize_row(&HtmlEscaper, &mut r);

        assert_eq!(r.get_text("a"), Some("&lt;b&gt;x&lt;/b&gt;"));
        assert_eq!(r.get("n"), Some(&Value::Integer(5)));
        assert_eq!(r.get("blob"), Some(&Value::Blob(b"<raw>".to_vec())));
        assert_eq!(r.get("none"), Some(&Value::Null));
    }

    #[test]
    fn test_failed_values_are_skipped() {
        let picky = |raw: &str| {
            if raw.contains("bad") {
                Err(SanitizeError(raw.to_string()))
            } else {
                Ok(raw.to_uppercase())
            }
        };
        let mut r = row(&[
            ("first", Value::Text("bad<".to_string())),
            ("second", Value::Text("good".to_string())),
        ]);
        sanitize_row(&picky, &mut r);

        assert_eq!(r.get_text("first"), Some("bad<"));
        assert_eq!(r.get_text("second"), Some("GOOD"));
    }

    #[test]
    fn test_sanitize_set_skips_non_rows() {
        let mut set = vec![
            Fetched::Row(row(&[("a", Value::Text("<i>".to_string()))])),
            Fetched::Values(vec![Value::Text("<u>".to_string())]),
            Fetched::Scalar(Value::Text("<s>".to_string())),
        ];
        sanitize_set(&HtmlEscaper, &mut set);

        assert_eq!(set[0].as_row().unwrap().get_text("a"), Some("&lt;i&gt;"));
        match &set[1] {
            Fetched::Values(values) => assert_eq!(values[0], Value::Text("&lt;u&gt;".to_string())),
            other => panic!("Expected positional row, got {:?}", other),
        }
        assert_eq!(set[2].as_scalar(), Some(&Value::Text("<s>".to_string())));
    }
}
