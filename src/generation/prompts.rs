/// System message sent with every request.
pub const SYSTEM_PROMPT: &str = "You analyze documents and write short, factual metadata \
    about them. Always answer with a single valid JSON object that matches the requested schema \
    and nothing else.";

/// Prompt for the vision model: title and description from page images.
pub fn document_prompt(name: &str, pages_shown: usize, total_pages: u32, language: &str) -> String {
    format!(
        "The images are {pages_shown} of the {total_pages} pages of the document \"{name}\".\n\
         Write a concise plain-text description capturing the purpose of the document and its \
         key details (parties, dates, amounts, identifiers), and a short title of at most twelve \
         words.\n\
         Respond in {}.",
        language_name(language)
    )
}

/// First stage for structured text: description from an excerpt.
pub fn excerpt_description_prompt(
    name: &str,
    excerpt: &str,
    truncated: bool,
    language: &str,
) -> String {
    let scope = if truncated {
        "The following is the beginning of the file"
    } else {
        "The following is the full text of the file"
    };
    format!(
        "{scope} \"{name}\".\n\n---\n{excerpt}\n---\n\n\
         Write a concise plain-text description capturing its purpose and key details \
         (parties, dates, amounts, identifiers).\n\
         Respond in {}.",
        language_name(language)
    )
}

/// First stage for containers: collection description from child descriptions.
pub fn collection_description_prompt(
    name: &str,
    aggregate: &str,
    described: usize,
    total_children: usize,
    language: &str,
) -> String {
    format!(
        "The archive \"{name}\" contains {total_children} item(s). Descriptions of the {described} \
         item(s) that could be read:\n\n{aggregate}\n\n\
         Write a semantic plain-text description of the collection as a whole: what it is for and \
         what kind of documents it holds.\n\
         Respond in {}.",
        language_name(language)
    )
}

/// Second stage: concise title from a description.
pub fn title_prompt(description: &str, is_collection: bool, language: &str) -> String {
    let subject = if is_collection {
        "a collection of documents"
    } else {
        "a document"
    };
    format!(
        "Here is the description of {subject}:\n\n{description}\n\n\
         Write a concise, specific title for it of at most twelve words, without quotes or a \
         trailing period.\n\
         Respond in {}.",
        language_name(language)
    )
}

/// Human-readable language name for common ISO 639-1 codes. Anything else passes through.
pub fn language_name(code: &str) -> &str {
    match code.trim().to_ascii_lowercase().as_str() {
        "es" => "Spanish",
        "en" => "English",
        "pt" => "Portuguese",
        "fr" => "French",
        "de" => "German",
        "it" => "Italian",
        "ca" => "Catalan",
        _ => code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_codes_expand() {
        assert_eq!(language_name("ES"), "Spanish");
        assert_eq!(language_name("Klingon"), "Klingon");
    }

    #[test]
    fn collection_prompt_embeds_aggregate() {
        let prompt = collection_description_prompt("a.zip", "- doc3.pdf: lease", 1, 2, "en");
        assert!(prompt.contains("- doc3.pdf: lease"));
        assert!(prompt.contains("contains 2 item(s)"));
        assert!(prompt.ends_with("Respond in English."));
    }
}
