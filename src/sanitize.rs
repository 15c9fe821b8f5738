//! §4.B Sanitizer contract: a byte-level HTML state machine. No reliance
//! on host-DOM parsing, by the spec's explicit constraint; this is also
//! why we hand-roll it rather than reach for a DOM-based crate.
use std::collections::HashSet;

const STRIPPED_TAGS: &[&str] = &[
    "script", "style", "iframe", "svg", "object", "embed", "template", "math", "noscript", "xmp",
    "plaintext",
];

const ALLOWED_STYLE_PROPS: &[&str] = &["text-decoration", "text-align"];
const ALLOWED_STYLE_VALUES: &[&str] = &[
    "underline", "line-through", "none", "left", "right", "center", "justify",
];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Text,
    TagName,
    AttrName,
    AttrValue(u8),
    /// Inside a tag whose text content (and all nested markup) must be
    /// dropped entirely, e.g. `<script>...</script>`.
    StrippedContent,
}

/// Sanitizes `input`, returning a byte string safe to embed in a
/// browser-class renderer. Idempotent: `sanitize(sanitize(s)) == sanitize(s)`
/// (P3), because every disallowed construct that could reappear after a
/// first pass (raw `<`, disallowed protocols, disallowed attributes) is
/// re-escaped or re-stripped identically on a second pass.
pub fn sanitize(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    let mut mode = Mode::Text;
    let mut strip_until: Option<String> = None;
    let mut current_tag = String::new();
    let mut current_attr = String::new();
    let mut current_value = String::new();
    let mut tag_attrs: Vec<(String, String)> = Vec::new();
    let mut tag_open_start = 0usize;
    let mut is_closing_tag = false;

    while i < bytes.len() {
        let c = bytes[i];
        match mode {
            Mode::Text => {
                if c == b'<' {
                    if let Some(ref stop_tag) = strip_until {
                        if matches_closing_tag(bytes, i, stop_tag) {
                            strip_until = None;
                            i += stop_tag.len() + 3; // "</" + tag + ">"
                            continue;
                        }
                        i += 1;
                        continue;
                    }
                    tag_open_start = i;
                    current_tag.clear();
                    tag_attrs.clear();
                    is_closing_tag = bytes.get(i + 1) == Some(&b'/');
                    mode = Mode::TagName;
                    i += if is_closing_tag { 2 } else { 1 };
                    continue;
                }
                if strip_until.is_none() {
                    push_escaped_char(&mut out, c);
                }
                i += 1;
            }
            Mode::TagName => {
                if c.is_ascii_alphanumeric() {
                    current_tag.push(c.to_ascii_lowercase() as char);
                    i += 1;
                } else if c == b'>' || c.is_ascii_whitespace() || c == b'/' {
                    if c == b'>' {
                        finish_tag(
                            &current_tag,
                            is_closing_tag,
                            &tag_attrs,
                            &mut out,
                            &mut strip_until,
                        );
                        mode = Mode::Text;
                        i += 1;
                    } else if c.is_ascii_whitespace() {
                        mode = Mode::AttrName;
                        current_attr.clear();
                        i += 1;
                    } else {
                        // self-closing slash; skip until '>'
                        i += 1;
                    }
                } else {
                    // malformed tag name char; bail into text, escaping the
                    // original '<' so no markup survives.
                    out.push_str("&lt;");
                    for &b in &bytes[tag_open_start + 1..=i] {
                        push_escaped_char(&mut out, b);
                    }
                    mode = Mode::Text;
                    i += 1;
                }
            }
            Mode::AttrName => {
                if c == b'>' {
                    finish_tag(&current_tag, is_closing_tag, &tag_attrs, &mut out, &mut strip_until);
                    mode = Mode::Text;
                    i += 1;
                } else if c == b'=' {
                    mode = Mode::AttrValue(0);
                    current_value.clear();
                    i += 1;
                } else if c.is_ascii_whitespace() {
                    if !current_attr.is_empty() {
                        tag_attrs.push((std::mem::take(&mut current_attr), String::new()));
                    }
                    i += 1;
                } else if c == b'/' {
                    i += 1;
                } else {
                    current_attr.push(c.to_ascii_lowercase() as char);
                    i += 1;
                }
            }
            Mode::AttrValue(quote) => {
                if quote == 0 {
                    // Value not yet quote-delimited: peek at the first byte.
                    if c == b'"' || c == b'\'' {
                        mode = Mode::AttrValue(c);
                        i += 1;
                        continue;
                    }
                    // Unquoted value: read until whitespace or '>'.
                    if c == b'>' || c.is_ascii_whitespace() {
                        tag_attrs.push((std::mem::take(&mut current_attr), std::mem::take(&mut current_value)));
                        mode = Mode::AttrName;
                        continue;
                    }
                    current_value.push(c as char);
                    i += 1;
                } else if c == quote {
                    tag_attrs.push((std::mem::take(&mut current_attr), std::mem::take(&mut current_value)));
                    mode = Mode::AttrName;
                    i += 1;
                } else {
                    current_value.push(c as char);
                    i += 1;
                }
            }
            Mode::StrippedContent => unreachable!("handled via strip_until in Text mode"),
        }
    }

    // Unterminated tag at end of input: the '<' and everything after it
    // never became valid markup, so escape the literal text.
    if mode != Mode::Text {
        out.push_str("&lt;");
        for &b in &bytes[tag_open_start + 1..] {
            push_escaped_char(&mut out, b);
        }
    }

    out
}

fn matches_closing_tag(bytes: &[u8], pos: usize, tag: &str) -> bool {
    let needle = format!("</{}", tag);
    bytes[pos..].len() >= needle.len()
        && bytes[pos..pos + needle.len()].eq_ignore_ascii_case(needle.as_bytes())
}

fn finish_tag(
    tag: &str,
    is_closing: bool,
    attrs: &[(String, String)],
    out: &mut String,
    strip_until: &mut Option<String>,
) {
    if tag.is_empty() {
        return;
    }
    if STRIPPED_TAGS.contains(&tag) {
        if !is_closing {
            *strip_until = Some(tag.to_string());
        }
        return;
    }
    if is_closing {
        out.push('<');
        out.push('/');
        out.push_str(tag);
        out.push('>');
        return;
    }
    out.push('<');
    out.push_str(tag);
    for (name, value) in attrs {
        if let Some(sanitised) = sanitise_attr(tag, name, value) {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            for ch in sanitised.chars() {
                push_escaped_char(out, ch as u8);
            }
            out.push('"');
        }
    }
    out.push('>');
}

fn sanitise_attr(_tag: &str, name: &str, value: &str) -> Option<String> {
    if name.starts_with("on") || name.starts_with("data-") {
        return None;
    }
    match name {
        "href" | "src" => sanitise_url(value),
        "style" => sanitise_style(value),
        _ => Some(value.to_string()),
    }
}

/// Decodes entities *before* protocol matching, per the spec's explicit
/// ordering requirement — otherwise `&#106;avascript:` smuggles past a
/// naive prefix check.
fn sanitise_url(value: &str) -> Option<String> {
    let decoded = decode_entities(value);
    let trimmed = decoded.trim();
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("http:") || lower.starts_with("https:") || lower.starts_with("mailto:") {
        Some(trimmed.to_string())
    } else {
        None
    }
}

fn sanitise_style(value: &str) -> Option<String> {
    let decoded = decode_entities(value);
    let mut kept = Vec::new();
    for decl in decoded.split(';') {
        let decl = decl.trim();
        if decl.is_empty() {
            continue;
        }
        let Some((prop, val)) = decl.split_once(':') else {
            continue;
        };
        let prop = prop.trim().to_ascii_lowercase();
        let val = val.trim().to_ascii_lowercase();
        if ALLOWED_STYLE_PROPS.contains(&prop.as_str()) && ALLOWED_STYLE_VALUES.contains(&val.as_str()) {
            kept.push(format!("{}: {}", prop, val));
        }
    }
    if kept.is_empty() {
        None
    } else {
        Some(kept.join("; "))
    }
}

fn decode_entities(s: &str) -> String {
    let named: HashSet<&str> = ["amp", "lt", "gt", "quot", "#39", "apos"].into_iter().collect();
    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'&' {
            if let Some(end) = s[i..].find(';').map(|p| i + p) {
                let entity = &s[i + 1..end];
                let replacement = match entity {
                    "amp" => Some('&'),
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "#39" | "apos" => Some('\''),
                    _ => entity
                        .strip_prefix('#')
                        .and_then(|n| n.parse::<u32>().ok())
                        .and_then(char::from_u32),
                };
                if let Some(ch) = replacement {
                    if named.contains(entity) || entity.starts_with('#') {
                        out.push(ch);
                        i = end + 1;
                        continue;
                    }
                }
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

fn push_escaped_char(out: &mut String, byte: u8) {
    match byte {
        b'<' => out.push_str("&lt;"),
        b'>' => out.push_str("&gt;"),
        b'&' => out.push_str("&amp;"),
        b'"' => out.push_str("&quot;"),
        _ => out.push(byte as char),
    }
}

/// Formats the `[troparcel:<key> from <author>]` attribution footer
/// (§4.F), escaping both interpolated fields so a crafted key cannot
/// inject markup (S6).
pub fn format_attribution_footer(note_key: &str, author: &str) -> String {
    format!(
        "[troparcel:{} from {}]",
        escape_plain(note_key),
        escape_plain(author)
    )
}

fn escape_plain(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        push_escaped_char(&mut out, b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_script_tag_and_its_content() {
        let out = sanitize("before<script>alert(1)</script>after");
        assert_eq!(out, "beforeafter");
    }

    #[test]
    fn strips_event_handler_and_data_attrs() {
        let out = sanitize(r#"<img src="https://x/y.png" onerror="alert(1)" data-foo="bar">"#);
        assert!(!out.contains("onerror"));
        assert!(!out.contains("data-foo"));
        assert!(out.contains(r#"src="https://x/y.png""#));
    }

    #[test]
    fn rejects_javascript_url() {
        let out = sanitize(r#"<a href="javascript:alert(1)">click</a>"#);
        assert!(!out.contains("href"));
    }

    #[test]
    fn decodes_entities_before_protocol_check() {
        // "javascript:" with the 'j' HTML-entity-encoded must still be rejected.
        let out = sanitize(r#"<a href="&#106;avascript:alert(1)">x</a>"#);
        assert!(!out.contains("href"));
    }

    #[test]
    fn keeps_allowlisted_style_drops_rest() {
        let out = sanitize(r#"<span style="text-decoration: underline; position: absolute">x</span>"#);
        assert!(out.contains("text-decoration: underline"));
        assert!(!out.contains("position"));
    }

    #[test]
    fn sanitize_is_idempotent() {
        // P3
        let samples = [
            "<script>alert(1)</script>plain",
            r#"<a href="javascript:x" onclick="y">link</a>"#,
            "<b>bold</b> & <i>italic</i>",
            "<img src=x onerror=alert(1)>",
        ];
        for s in samples {
            let once = sanitize(s);
            let twice = sanitize(&once);
            assert_eq!(once, twice, "not idempotent for {:?}", s);
        }
    }

    #[test]
    fn note_key_injection_is_neutralised() {
        // S6
        let footer = format_attribution_footer("n_<img src=x onerror=alert(1)>", "alice");
        assert!(footer.contains("&lt;img"));
        assert!(!footer.contains("<img"));
    }
}
