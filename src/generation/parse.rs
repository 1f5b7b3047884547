use super::{GeneratedFields, GenerationError, GenerationTask};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

const DESCRIPTION_KEYS: &[&str] = &[
    "description",
    "descripcion",
    "descripción",
    "summary",
    "resumen",
];
const TITLE_KEYS: &[&str] = &["title", "titulo", "título"];
const LABEL_PREFIXES: &[&str] = &[
    "description:",
    "descripcion:",
    "descripción:",
    "resumen:",
    "summary:",
    "title:",
    "titulo:",
    "título:",
];

/// Parse raw model content into the fields `task` requires.
///
/// Structured JSON is preferred. When a model ignores the schema, a JSON-looking field is
/// salvaged with a pattern match, and single-field tasks accept cleaned plain text.
pub fn parse_fields(task: GenerationTask, raw: &str) -> Result<GeneratedFields, GenerationError> {
    let content = strip_code_fences(raw);

    let fields = match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => GeneratedFields {
            title: first_string(&map, TITLE_KEYS),
            description: first_string(&map, DESCRIPTION_KEYS),
        },
        Ok(Value::String(text)) => plain_text_fields(task, &text),
        _ => {
            let salvaged = GeneratedFields {
                title: salvage_field(&content, TITLE_KEYS),
                description: salvage_field(&content, DESCRIPTION_KEYS),
            };
            if salvaged.title.is_some() || salvaged.description.is_some() {
                salvaged
            } else {
                plain_text_fields(task, &content)
            }
        }
    };

    let fields = GeneratedFields {
        title: fields.title.map(|title| clean_text(&title)).filter(|t| !t.is_empty()),
        description: fields
            .description
            .map(|description| clean_text(&description))
            .filter(|d| !d.is_empty()),
    };

    match task {
        GenerationTask::Document => {
            fields.require_title()?;
            fields.require_description()?;
        }
        GenerationTask::Description => {
            fields.require_description()?;
        }
        GenerationTask::Title => {
            fields.require_title()?;
        }
    }
    Ok(fields)
}

fn plain_text_fields(task: GenerationTask, text: &str) -> GeneratedFields {
    let text = text.trim().to_string();
    match task {
        GenerationTask::Description => GeneratedFields {
            title: None,
            description: Some(text),
        },
        GenerationTask::Title => GeneratedFields {
            title: Some(text),
            description: None,
        },
        GenerationTask::Document => GeneratedFields::default(),
    }
}

fn first_string(map: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match map.get(*key) {
        Some(Value::String(value)) => Some(value.clone()),
        _ => None,
    })
}

fn salvage_field(content: &str, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        let pattern = Regex::new(&format!(
            r#""{}"\s*:\s*"((?:[^"\\]|\\.)*)"#,
            regex::escape(key)
        ))
        .ok()?;
        let captured = pattern.captures(content)?.get(1)?.as_str();
        let unescaped = serde_json::from_str::<String>(&format!("\"{captured}\""))
            .unwrap_or_else(|_| captured.replace("\\\"", "\"").replace("\\n", "\n"));
        Some(unescaped)
    })
}

fn strip_code_fences(raw: &str) -> String {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| {
        Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*\s*\n?(.*?)\n?\s*```\s*$")
            .expect("fence pattern is valid")
    });
    match fence.captures(raw).and_then(|captures| captures.get(1)) {
        Some(inner) => inner.as_str().trim().to_string(),
        None => raw.trim().to_string(),
    }
}

/// Strip wrapping quotes and leading field labels, and collapse whitespace.
pub fn clean_text(text: &str) -> String {
    let mut cleaned = text.trim();
    loop {
        let before = cleaned;
        for prefix in LABEL_PREFIXES {
            if cleaned.len() >= prefix.len()
                && cleaned.is_char_boundary(prefix.len())
                && cleaned[..prefix.len()].eq_ignore_ascii_case(prefix)
            {
                cleaned = cleaned[prefix.len()..].trim_start();
            }
        }
        cleaned = cleaned
            .trim_matches(|c| matches!(c, '"' | '\'' | '“' | '”' | '«' | '»'))
            .trim();
        if cleaned == before {
            break;
        }
    }
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_json_is_parsed() {
        let fields = parse_fields(
            GenerationTask::Document,
            r#"{"title": "Lease", "description": "Office lease for 2024."}"#,
        )
        .unwrap();
        assert_eq!(fields.title.as_deref(), Some("Lease"));
        assert_eq!(fields.description.as_deref(), Some("Office lease for 2024."));
    }

    #[test]
    fn fenced_json_is_unwrapped() {
        let raw = "```json\n{\"description\": \"Invoice from ACME\"}\n```";
        let fields = parse_fields(GenerationTask::Description, raw).unwrap();
        assert_eq!(fields.description.as_deref(), Some("Invoice from ACME"));
    }

    #[test]
    fn truncated_json_is_salvaged() {
        let raw = r#"{"description": "Minutes of the \"board\" meeting", "title": "Board min"#;
        let fields = parse_fields(GenerationTask::Description, raw).unwrap();
        assert_eq!(
            fields.description.as_deref(),
            Some(r#"Minutes of the "board" meeting"#)
        );
    }

    #[test]
    fn plain_text_is_accepted_for_single_field_tasks() {
        let fields =
            parse_fields(GenerationTask::Title, "Título: \"Contrato de arrendamiento\"").unwrap();
        assert_eq!(fields.title.as_deref(), Some("Contrato de arrendamiento"));
    }

    #[test]
    fn document_task_requires_both_fields() {
        let error =
            parse_fields(GenerationTask::Document, r#"{"description": "only this"}"#).unwrap_err();
        assert!(matches!(error, GenerationError::MalformedOutput(_)));
        let error = parse_fields(GenerationTask::Document, "just some prose").unwrap_err();
        assert!(matches!(error, GenerationError::MalformedOutput(_)));
    }

    #[test]
    fn labels_and_quotes_are_stripped() {
        assert_eq!(clean_text("  Summary:  'A  short   note' "), "A short note");
        assert_eq!(clean_text("Resumen: “Acta”"), "Acta");
    }
}
