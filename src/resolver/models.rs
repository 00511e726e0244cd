//! Response models and field-extraction helpers for the upstream API.
//!
//! Upstream responses mix strings, floats, and absent fields, so nothing
//! here attempts a fixed record parse; fields are pulled out of
//! `serde_json::Value` best-effort.

use serde_json::Value;

/// Result of a successful URL resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlResult {
    pub url: String,
    pub bitrate: i64,
    pub size: i64,
    /// Lowercase extension derived from the URL path, one of
    /// mp3/flac/m4a/ogg.
    pub extension: String,
}

/// Result of a successful lyric resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LyricResult {
    pub lyric: String,
    pub translation: String,
}

/// Best-effort string extraction: strings are trimmed, numbers are
/// truncated to integers, everything else falls back to its JSON text.
pub(crate) fn value_to_string(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(f) = n.as_f64() {
                (f as i64).to_string()
            } else {
                n.to_string()
            }
        }
        Some(other) => other.to_string().trim_matches('"').trim().to_string(),
    }
}

/// Expand the HTML entities upstream occasionally leaves in URLs, and trim.
pub(crate) fn sanitize_url(raw: &str) -> String {
    raw.trim()
        .replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
}

/// Derive the audio extension from a URL path, restricted to the formats
/// the pipeline knows how to tag. Defaults to mp3.
pub(crate) fn extract_extension(url_str: &str) -> String {
    let Ok(parsed) = url::Url::parse(url_str) else {
        return "mp3".to_string();
    };
    let path = parsed.path();
    if let Some(idx) = path.rfind('.') {
        if idx > 0 && idx < path.len() - 1 {
            let ext = path[idx + 1..].to_ascii_lowercase();
            if matches!(ext.as_str(), "mp3" | "flac" | "m4a" | "ogg") {
                return ext;
            }
        }
    }
    "mp3".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_to_string_variants() {
        assert_eq!(value_to_string(None), "");
        assert_eq!(value_to_string(Some(&Value::Null)), "");
        assert_eq!(value_to_string(Some(&json!("  abc  "))), "abc");
        assert_eq!(value_to_string(Some(&json!(42))), "42");
        assert_eq!(value_to_string(Some(&json!(42.9))), "42");
        assert_eq!(value_to_string(Some(&json!(true))), "true");
    }

    #[test]
    fn test_sanitize_url() {
        assert_eq!(
            sanitize_url(" https://cdn.example.com/a.mp3?x=1&amp;y=2 "),
            "https://cdn.example.com/a.mp3?x=1&y=2"
        );
        assert_eq!(sanitize_url("&quot;quoted&quot;"), "\"quoted\"");
        assert_eq!(sanitize_url("it&#x27;s"), "it's");
    }

    #[test]
    fn test_extract_extension() {
        assert_eq!(extract_extension("https://cdn.example.com/a.flac"), "flac");
        assert_eq!(extract_extension("https://cdn.example.com/a.mp3?sig=x"), "mp3");
        assert_eq!(extract_extension("https://cdn.example.com/a.M4A"), "m4a");
        assert_eq!(extract_extension("https://cdn.example.com/a.ogg"), "ogg");
        // Unknown or missing extensions default to mp3
        assert_eq!(extract_extension("https://cdn.example.com/a.wav"), "mp3");
        assert_eq!(extract_extension("https://cdn.example.com/audio"), "mp3");
        assert_eq!(extract_extension("not a url"), "mp3");
    }
}
