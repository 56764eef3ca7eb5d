//! Text preparation before speech synthesis.
//!
//! Language models like to sprinkle emoji and decorative symbols into
//! replies. Speech services either read them out loud ("smiling face with
//! heart eyes") or reject the request, so the spoken copy of each line is
//! reduced to a safe character set. The utterance's own `text` field is
//! never touched; only the string handed to the synthesizer is cleaned.

/// Keep printable ASCII, Latin-1 letters and the Latin Extended blocks,
/// plus whitespace (normalised later). Everything else is dropped.
fn is_speakable(ch: char) -> bool {
    matches!(ch, ' '..='~')
        || matches!(ch, '\u{00C0}'..='\u{024F}')
        || ch.is_whitespace()
}

/// Strip characters unsuitable for synthesis, collapse whitespace runs to
/// a single space and trim the ends. Never fails; the worst case is an
/// empty string, which callers treat as "nothing to say".
pub fn sanitize(text: &str) -> String {
    let filtered: String = text.chars().filter(|c| is_speakable(*c)).collect();
    filtered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// True when a sanitized line has nothing left to speak.
pub fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

/// Enforce the speech service's length budget. Overlong text is cut on a
/// character boundary and suffixed with an ellipsis so the total stays
/// within `max_chars`.
pub fn truncate_for_synthesis(text: &str, max_chars: usize) -> String {
    const ELLIPSIS: &str = "...";
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars <= ELLIPSIS.len() {
        return text.chars().take(max_chars).collect();
    }
    let mut out: String = text.chars().take(max_chars - ELLIPSIS.len()).collect();
    out.push_str(ELLIPSIS);
    out
}
