//! Media markers in message and prompt text.
//!
//! Media is referenced inline as `<__media:IDENTITY__>`, where the identity is
//! usually a file path. The marker survives chat-template rendering verbatim,
//! so the rendered prompt can be split back into text spans and media spans.

use regex::Regex;
use std::sync::LazyLock;

static MEDIA_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<__media:(.+?)__>").expect("media marker pattern is valid")
});

/// A span of rendered text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    /// The identity inside a media marker.
    Media(&'a str),
}

/// The marker that references `identity`.
pub fn media_marker(identity: &str) -> String {
    format!("<__media:{identity}__>")
}

/// Split `text` into text and media spans, in order. Empty text spans are
/// omitted.
pub fn segments(text: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut last = 0;
    for caps in MEDIA_MARKER.captures_iter(text) {
        let (Some(whole), Some(identity)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if let Some(span) = text.get(last..whole.start())
            && !span.is_empty()
        {
            out.push(Segment::Text(span));
        }
        out.push(Segment::Media(identity.as_str()));
        last = whole.end();
    }
    if let Some(rest) = text.get(last..)
        && !rest.is_empty()
    {
        out.push(Segment::Text(rest));
    }
    out
}

/// Media identities referenced in `text`, in order of appearance.
pub fn media_identities(text: &str) -> impl Iterator<Item = &str> {
    MEDIA_MARKER
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
}
