use std::borrow::Cow;

use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

/// Terminal columns occupied by `s`.
///
/// Hangul and other wide characters count as two columns; combining marks
/// count as zero.
///
/// ```
/// use archdict::util::display_width;
///
/// assert_eq!(display_width("Dolmen"), 6);
/// assert_eq!(display_width("고인돌"), 6);
/// ```
pub fn display_width(s: &str) -> usize {
    UnicodeWidthStr::width(s)
}

const ELLIPSIS: &str = "...";
const ELLIPSIS_WIDTH: usize = 3;

/// Shorten `s` to at most `max_width` columns, marking the cut with "...".
///
/// Returns the input unchanged (borrowed) when it already fits. Widths too
/// narrow for a character plus the ellipsis get a plain prefix instead.
///
/// ```
/// use archdict::util::truncate_to_width;
///
/// assert_eq!(truncate_to_width("Shell mound", 8), "Shell...");
/// assert_eq!(truncate_to_width("빗살무늬토기", 9), "빗살무...");
/// assert_eq!(truncate_to_width("Dolmen", 20), "Dolmen");
/// ```
pub fn truncate_to_width(s: &str, max_width: usize) -> Cow<'_, str> {
    if display_width(s) <= max_width {
        return Cow::Borrowed(s);
    }
    if max_width <= ELLIPSIS_WIDTH {
        return Cow::Owned(prefix_within(s, max_width).to_owned());
    }

    let kept = prefix_within(s, max_width - ELLIPSIS_WIDTH);
    Cow::Owned(format!("{}{}", kept, ELLIPSIS))
}

/// Longest prefix of `s` that fits in `width` columns.
fn prefix_within(s: &str, width: usize) -> &str {
    let mut used = 0;
    for (idx, c) in s.char_indices() {
        let w = UnicodeWidthChar::width(c).unwrap_or(0);
        if used + w > width {
            return &s[..idx];
        }
        used += w;
    }
    s
}

/// Truncate or right-pad `s` with spaces to exactly `width` columns.
///
/// A wide character that would straddle the boundary is dropped, so the
/// result can be one column short before padding fills it.
pub fn fit_to_width(s: &str, width: usize) -> String {
    let cut = truncate_to_width(s, width);
    let pad = width.saturating_sub(display_width(&cut));
    let mut out = String::with_capacity(cut.len() + pad);
    out.push_str(&cut);
    out.extend(std::iter::repeat(' ').take(pad));
    out
}

fn is_stripped_control(c: char) -> bool {
    (c.is_ascii_control() && !matches!(c, '\t' | '\n' | '\r')) || ('\u{80}'..='\u{9f}').contains(&c)
}

/// Remove terminal control characters and ANSI escape sequences.
///
/// Catalog text is remote input and is printed straight to the terminal.
/// CSI (`ESC [ ... final`) and OSC (`ESC ] ... BEL` or `ESC ] ... ESC \`)
/// sequences are dropped whole; other C0/C1 controls and DEL are dropped
/// individually. Tab, newline and carriage return are kept.
///
/// Borrows when nothing needs removing.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    if !s.chars().any(is_stripped_control) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            if !is_stripped_control(c) {
                out.push(c);
            }
            continue;
        }

        match chars.peek() {
            Some('[') => {
                chars.next();
                // Parameter and intermediate bytes, then one final byte
                for c in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&c) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\u{07}' {
                        break;
                    }
                    if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            _ => {}
        }
    }

    Cow::Owned(out)
}

/// Collapse all whitespace runs (including newlines) to single spaces.
///
/// Used for one-line listing rows; borrows when `s` is already one line
/// with no repeated whitespace.
pub fn single_line(s: &str) -> Cow<'_, str> {
    let trimmed = s.trim();
    let clean = !trimmed
        .chars()
        .zip(trimmed.chars().skip(1))
        .any(|(a, b)| a.is_whitespace() && b.is_whitespace())
        && !trimmed.chars().any(|c| c.is_whitespace() && c != ' ');
    if clean {
        return Cow::Borrowed(trimmed);
    }
    Cow::Owned(trimmed.split_whitespace().collect::<Vec<_>>().join(" "))
}
