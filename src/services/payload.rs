//! Schema-validating decode of completion payloads.
//!
//! Backends are asked for JSON but may wrap it in Markdown fences, prefix it
//! with chatter, or return something else entirely. Every stage decodes
//! through [`decode_payload`] and decides itself whether an error is fatal.

use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("completion is empty")]
    Empty,
    #[error("no JSON object found in completion")]
    NoJsonObject,
    #[error("completion does not match the expected schema: {0}")]
    Schema(String),
    #[error("completion failed validation: {0}")]
    Invalid(String),
}

/// Semantic checks that serde alone cannot express.
pub trait Validate {
    fn validate(&self) -> Result<(), String>;
}

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json").trim_end_matches("```").trim().to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```").trim_end_matches("```").trim().to_string()
    } else {
        s.to_string()
    }
}

/// Returns the first balanced `{...}` span, honouring string literals and escapes.
pub fn extract_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

pub fn decode_payload<T>(raw: &str) -> Result<T, PayloadError>
where
    T: DeserializeOwned + Validate,
{
    let cleaned = strip_code_blocks(raw);
    if cleaned.is_empty() {
        return Err(PayloadError::Empty);
    }
    let json = extract_json_object(&cleaned).ok_or(PayloadError::NoJsonObject)?;
    let value: T = serde_json::from_str(json).map_err(|e| PayloadError::Schema(e.to_string()))?;
    value.validate().map_err(PayloadError::Invalid)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct TextOnly {
        text: String,
    }

    impl Validate for TextOnly {
        fn validate(&self) -> Result<(), String> {
            if self.text.trim().is_empty() {
                Err("text is empty".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_strip_code_blocks() {
        assert_eq!(strip_code_blocks("json"), "json");
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("  ```json  \n  {}  \n  ```  "), "{}");
    }

    #[test]
    fn test_extracts_object_surrounded_by_chatter() {
        let raw = "Sure! Here it is: {\"text\": \"a } brace \\\" inside\"} Hope that helps {x}";
        assert_eq!(
            extract_json_object(raw),
            Some("{\"text\": \"a } brace \\\" inside\"}")
        );
    }

    #[test]
    fn test_decode_success() {
        let decoded: TextOnly = decode_payload("```json\n{\"text\": \"hello\", \"extra\": 1}\n```").unwrap();
        assert_eq!(decoded.text, "hello");
    }

    #[test]
    fn test_decode_failures_are_tagged() {
        assert_eq!(decode_payload::<TextOnly>("   ").unwrap_err(), PayloadError::Empty);
        assert_eq!(decode_payload::<TextOnly>("I cannot help").unwrap_err(), PayloadError::NoJsonObject);
        assert!(matches!(decode_payload::<TextOnly>("{\"txt\": 1}").unwrap_err(), PayloadError::Schema(_)));
        assert!(matches!(decode_payload::<TextOnly>("{\"text\": \" \"}").unwrap_err(), PayloadError::Invalid(_)));
        assert_eq!(decode_payload::<TextOnly>("{\"text\": \"unclosed\"").unwrap_err(), PayloadError::NoJsonObject);
    }
}
