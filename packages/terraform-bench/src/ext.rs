//! Text helpers for rendering tool output.

use std::borrow::Cow;

use ::indent::indent_all_by;
use extfn::extfn;

/// Indent all non-empty lines by the given number of spaces.
#[extfn]
pub fn indent<'a>(self: impl Into<Cow<'a, str>>, level: usize) -> String {
    indent_all_by(level, self)
}

/// Cut the text to at most `max` characters, marking the cut with `…`.
#[extfn]
pub fn truncate_chars(self: &str, max: usize) -> String {
    match self.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &self[..idx]),
        None => self.to_string(),
    }
}

/// Remove ANSI escape sequences, as emitted by terraform without `-no-color`.
#[extfn]
pub fn strip_ansi(self: &str) -> String {
    let mut out = String::with_capacity(self.len());
    let mut chars = self.chars();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            for c in chars.by_ref() {
                if c.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}
