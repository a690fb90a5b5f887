//! Caption cleanup for raw model output.
//!
//! Vision models wrap captions in all sorts of noise: `<think>` blocks from
//! reasoning models, surrounding quotes, "Caption:" labels, trailing
//! explanations on later lines. [`clean_caption`] reduces a response to the
//! caption itself.

/// Strip `<think>...</think>` blocks emitted by reasoning models.
///
/// Handles both complete and incomplete think blocks:
/// - `<think>reasoning</think>content` -> `content`
/// - `<think>reasoning without closing` -> `` (strips to end)
pub fn strip_think_tags(text: &str) -> String {
    let mut result = text.to_string();
    while let Some(start) = result.find("<think>") {
        if let Some(end) = result[start..].find("</think>") {
            result = format!("{}{}", &result[..start], &result[start + end + 8..]);
        } else {
            // No closing tag, strip from <think> to end
            result = result[..start].to_string();
            break;
        }
    }
    result
}

/// Reduce a raw model response to a single caption line that begins with
/// `prompt`.
///
/// Returns `None` when nothing is left after cleanup.
pub fn clean_caption(raw: &str, prompt: &str) -> Option<String> {
    let stripped = strip_think_tags(raw);
    let line = stripped
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())?;

    let mut caption = line;
    for label in ["Caption:", "caption:", "CAPTION:"] {
        if let Some(rest) = caption.strip_prefix(label) {
            caption = rest.trim_start();
        }
    }
    let caption = caption
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim();
    if caption.is_empty() {
        return None;
    }

    let prompt = prompt.trim();
    if prompt.is_empty() || starts_with_ignore_case(caption, prompt) {
        return Some(caption.to_string());
    }

    // Lowercase the first letter so "a photo of" + "A cat" reads naturally
    let mut chars = caption.chars();
    let continued = match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect::<String>(),
        None => String::new(),
    };
    Some(format!("{} {}", prompt, continued))
}

fn starts_with_ignore_case(text: &str, prefix: &str) -> bool {
    text.len() >= prefix.len()
        && text.is_char_boundary(prefix.len())
        && text[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Count whitespace-separated words.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}
