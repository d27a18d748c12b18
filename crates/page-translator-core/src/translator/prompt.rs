//! Prompt construction and response parsing for chat-completion backends.

use serde::Deserialize;
use tracing::warn;

use super::traits::{FixHint, PageTranslation, VerificationReport};
use crate::config::{Lang, language_name};
use crate::error::{Error, Result};
use crate::model::{Annotation, Severity};

/// Separates the translated text from the trailing annotation list.
pub const ANNOTATIONS_MARKER: &str = "<<<ANNOTATIONS>>>";

pub fn translation_instructions(source: &Lang, target: &Lang, hint: Option<&FixHint>) -> String {
    let source_hint = if source.is_auto() {
        String::new()
    } else {
        format!(" from {}", language_name(source))
    };

    let mut prompt = format!(
        "Translate the page{source_hint} into {target}. Preserve paragraph breaks, \
         headings and lists. Output only the translation.\n\n\
         If some passages are uncertain or illegible, end your answer with a line \
         containing exactly {ANNOTATIONS_MARKER} followed by a JSON array of objects \
         with fields \"kind\" (\"doubt\" or \"error\"), \"original\", \"translated\" \
         and \"comment\". Omit the marker when there is nothing to flag.",
        target = language_name(target),
    );

    if let Some(hint) = hint {
        prompt.push_str(
            "\n\nA reviewer found serious problems in a previous translation of this page. \
             Fix them in the new translation.",
        );
        if let Some(summary) = &hint.summary {
            prompt.push_str("\nReviewer summary: ");
            prompt.push_str(summary);
        }
        for item in &hint.evidence {
            prompt.push_str("\n- ");
            prompt.push_str(item);
        }
        if let Some(previous) = &hint.previous_translation {
            prompt.push_str("\n\nPrevious translation:\n");
            prompt.push_str(previous);
        }
    }

    prompt
}

pub fn verification_instructions(source: &Lang, target: &Lang) -> String {
    let source_name = if source.is_auto() {
        "the source language"
    } else {
        language_name(source)
    };
    format!(
        "You review translations from {source_name} into {target}. Compare the \
         translation with the source page and answer with a JSON object: \
         {{\"severity\": \"ok\" | \"minor\" | \"severe\", \"summary\": string, \
         \"evidence\": [string], \"annotations\": [{{\"kind\": \"doubt\" | \"error\", \
         \"original\": string, \"translated\": string, \"comment\": string}}]}}. \
         Use \"severe\" only for omissions, mistranslations that change meaning, \
         or text in the wrong language.",
        target = language_name(target),
    )
}

/// The part of a streamed answer that belongs to the translation itself.
pub fn visible_prefix(accumulated: &str) -> &str {
    match accumulated.find(ANNOTATIONS_MARKER) {
        Some(index) => &accumulated[..index],
        None => {
            // Hold back a partial marker at the end of the buffer
            let keep = (1..ANNOTATIONS_MARKER.len())
                .rev()
                .find(|&n| accumulated.ends_with(&ANNOTATIONS_MARKER[..n]))
                .unwrap_or(0);
            &accumulated[..accumulated.len() - keep]
        }
    }
}

/// Split a raw answer into translation text and annotations.
pub fn split_translation(raw: &str) -> PageTranslation {
    let (text, annotations) = match raw.split_once(ANNOTATIONS_MARKER) {
        Some((text, tail)) => {
            let tail = strip_code_fence(tail);
            let annotations = serde_json::from_str::<Vec<Annotation>>(tail).unwrap_or_else(|e| {
                warn!("Ignoring malformed annotation block: {}", e);
                Vec::new()
            });
            (text, annotations)
        }
        None => (raw, Vec::new()),
    };

    PageTranslation {
        text: text.trim().to_string(),
        annotations,
    }
}

#[derive(Debug, Deserialize)]
struct RawVerification {
    severity: Severity,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    evidence: Vec<String>,
    #[serde(default)]
    annotations: Vec<Annotation>,
}

pub fn parse_verification(raw: &str) -> Result<VerificationReport> {
    let parsed: RawVerification = serde_json::from_str(strip_code_fence(raw))
        .map_err(|e| Error::VerificationInvalidResponse(e.to_string()))?;
    Ok(VerificationReport {
        severity: parsed.severity,
        summary: parsed.summary,
        evidence: parsed.evidence,
        annotations: parsed.annotations,
    })
}

/// Remove a surrounding Markdown code fence, if any.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AnnotationKind;

    #[test]
    fn test_split_translation_with_annotations() {
        let raw = format!(
            "Hello world.\n\n{ANNOTATIONS_MARKER}\n```json\n[{{\"kind\":\"doubt\",\"original\":\"Welt\",\"comment\":\"blurred\"}}]\n```"
        );
        let page = split_translation(&raw);
        assert_eq!(page.text, "Hello world.");
        assert_eq!(page.annotations.len(), 1);
        assert_eq!(page.annotations[0].kind, AnnotationKind::Doubt);
        assert_eq!(page.annotations[0].original.as_deref(), Some("Welt"));
    }

    #[test]
    fn test_split_translation_malformed_annotations_kept_text() {
        let raw = format!("Text{ANNOTATIONS_MARKER}not json");
        let page = split_translation(&raw);
        assert_eq!(page.text, "Text");
        assert!(page.annotations.is_empty());
    }

    #[test]
    fn test_visible_prefix_holds_back_partial_marker() {
        assert_eq!(visible_prefix("Hello <<<ANNO"), "Hello ");
        assert_eq!(visible_prefix("Hello <<<ANNOTATIONS>>>[...]"), "Hello ");
        assert_eq!(visible_prefix("a < b"), "a < b");
        assert_eq!(visible_prefix("ends with <"), "ends with ");
    }

    #[test]
    fn test_parse_verification() {
        let report = parse_verification(
            "```json\n{\"severity\":\"severe\",\"summary\":\"Paragraph 2 missing\",\"evidence\":[\"line 4 omitted\"]}\n```",
        )
        .unwrap();
        assert_eq!(report.severity, Severity::Severe);
        assert_eq!(report.evidence, vec!["line 4 omitted".to_string()]);
        assert!(report.annotations.is_empty());
    }

    #[test]
    fn test_parse_verification_rejects_unknown_severity() {
        let result = parse_verification(r#"{"severity":"catastrophic"}"#);
        assert!(matches!(result, Err(Error::VerificationInvalidResponse(_))));
    }

    #[test]
    fn test_fix_hint_in_instructions() {
        let hint = FixHint {
            summary: Some("Wrong language".to_string()),
            evidence: vec!["paragraph left in French".to_string()],
            previous_translation: Some("Bonjour".to_string()),
        };
        let prompt = translation_instructions(&Lang::new("fr"), &Lang::new("en"), Some(&hint));
        assert!(prompt.contains("from French into English"));
        assert!(prompt.contains("- paragraph left in French"));
        assert!(prompt.contains("Previous translation:\nBonjour"));
    }
}
