use super::ExtractionError;
use crate::classify::suffix;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use std::sync::OnceLock;

/// XML elements carrying signature material rather than document content.
const XML_SIGNATURE_ELEMENTS: &[&str] = &[
    "Signature",
    "SignedInfo",
    "SignatureValue",
    "KeyInfo",
    "X509Data",
    "X509Certificate",
    "Modulus",
    "Exponent",
    "CanonicalizationMethod",
    "SignatureMethod",
    "Reference",
    "DigestValue",
    "DigestMethod",
    "Transforms",
    "Transform",
];

/// Produce a readable excerpt bounded to `limit` characters.
///
/// Returns the excerpt and whether the source held more text.
pub fn excerpt(name: &str, bytes: &[u8], limit: usize) -> Result<(String, bool), ExtractionError> {
    let raw = String::from_utf8_lossy(bytes);
    let readable = match suffix(name).as_deref() {
        Some("xml") => strip_xml(&raw),
        Some("html" | "htm") => strip_html(&raw),
        Some("eml") => email_text(&raw),
        _ => raw.into_owned(),
    };
    let normalized = normalize_whitespace(&readable);
    if normalized.is_empty() {
        return Err(ExtractionError::CorruptSource(format!(
            "{name} contains no readable text"
        )));
    }
    Ok(truncate_chars(normalized, limit))
}

fn truncate_chars(text: String, limit: usize) -> (String, bool) {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => (text[..cut].trim_end().to_string(), true),
        None => (text, false),
    }
}

fn normalize_whitespace(text: &str) -> String {
    let mut lines = Vec::new();
    let mut blank_run = 0;
    for line in text.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            blank_run += 1;
            if blank_run > 1 || lines.is_empty() {
                continue;
            }
        } else {
            blank_run = 0;
        }
        lines.push(collapsed);
    }
    lines.join("\n").trim().to_string()
}

fn signature_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        XML_SIGNATURE_ELEMENTS
            .iter()
            .map(|element| {
                Regex::new(&format!(
                    r"(?s)<(?:[\w.-]+:)?{element}\b[^>]*?(?:/>|>.*?</(?:[\w.-]+:)?{element}\s*>)"
                ))
                .expect("signature pattern is valid")
            })
            .collect()
    })
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("tag pattern is valid"))
}

fn strip_xml(raw: &str) -> String {
    let mut text = raw.to_string();
    for pattern in signature_patterns() {
        text = pattern.replace_all(&text, " ").into_owned();
    }
    decode_entities(&tag_pattern().replace_all(&text, "\n"))
}

fn strip_html(raw: &str) -> String {
    static NOISE: OnceLock<Vec<Regex>> = OnceLock::new();
    let noise = NOISE.get_or_init(|| {
        ["script", "style", "head"]
            .iter()
            .map(|element| {
                Regex::new(&format!(r"(?is)<{element}\b.*?</{element}\s*>"))
                    .expect("html pattern is valid")
            })
            .collect()
    });
    let mut text = raw.to_string();
    for pattern in noise {
        text = pattern.replace_all(&text, " ").into_owned();
    }
    decode_entities(&tag_pattern().replace_all(&text, "\n"))
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Headers worth keeping from an email, followed by its first text body.
fn email_text(raw: &str) -> String {
    let (headers, body) = split_headers(raw);
    let mut out = Vec::new();
    for wanted in ["Subject", "From", "To", "Date"] {
        if let Some(value) = header_value(&headers, wanted) {
            out.push(format!("{wanted}: {value}"));
        }
    }
    out.push(String::new());
    out.push(email_body(&headers, body));
    out.join("\n")
}

fn split_headers(raw: &str) -> (Vec<(String, String)>, &str) {
    let (head, body) = raw
        .split_once("\r\n\r\n")
        .or_else(|| raw.split_once("\n\n"))
        .unwrap_or((raw, ""));

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in head.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
        } else if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }
    }
    (headers, body)
}

fn header_value<'a>(headers: &'a [(String, String)], key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .map(|(_, value)| value.as_str())
}

fn email_body(headers: &[(String, String)], body: &str) -> String {
    let content_type = header_value(headers, "Content-Type").unwrap_or("text/plain");
    if content_type.to_ascii_lowercase().starts_with("multipart/") {
        if let Some(boundary) = boundary(content_type) {
            let delimiter = format!("--{boundary}");
            let parts: Vec<_> = body
                .split(delimiter.as_str())
                .skip(1)
                .map(split_headers)
                .collect();
            let preferred = parts
                .iter()
                .find(|(part_headers, _)| part_is(part_headers, "text/plain"))
                .or_else(|| {
                    parts
                        .iter()
                        .find(|(part_headers, _)| part_is(part_headers, "text/html"))
                });
            if let Some((part_headers, part_body)) = preferred {
                return email_body(part_headers, part_body);
            }
        }
        return String::new();
    }

    let decoded = decode_transfer(headers, body);
    if content_type.to_ascii_lowercase().starts_with("text/html") {
        strip_html(&decoded)
    } else {
        decoded
    }
}

fn part_is(headers: &[(String, String)], mime: &str) -> bool {
    header_value(headers, "Content-Type")
        .unwrap_or("text/plain")
        .to_ascii_lowercase()
        .starts_with(mime)
}

fn boundary(content_type: &str) -> Option<&str> {
    content_type.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        key.eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"'))
    })
}

fn decode_transfer(headers: &[(String, String)], body: &str) -> String {
    let encoding = header_value(headers, "Content-Transfer-Encoding")
        .unwrap_or_default()
        .to_ascii_lowercase();
    match encoding.as_str() {
        "base64" => {
            let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
            STANDARD
                .decode(compact)
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_else(|_| body.to_string())
        }
        "quoted-printable" => decode_quoted_printable(body),
        _ => body.to_string(),
    }
}

fn decode_quoted_printable(body: &str) -> String {
    let mut bytes = Vec::with_capacity(body.len());
    let raw = body.replace("=\r\n", "").replace("=\n", "");
    let mut iter = raw.bytes().peekable();
    while let Some(byte) = iter.next() {
        if byte == b'=' {
            let high = iter.next();
            let low = iter.next();
            let decoded = high.zip(low).and_then(|(h, l)| {
                u8::from_str_radix(&format!("{}{}", h as char, l as char), 16).ok()
            });
            match decoded {
                Some(value) => bytes.push(value),
                None => {
                    bytes.push(b'=');
                    bytes.extend(high);
                    bytes.extend(low);
                }
            }
        } else {
            bytes.push(byte);
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
