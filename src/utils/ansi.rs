use once_cell::sync::Lazy;
use regex::Regex;

// CSI: ESC [ params final-letter
static CSI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?=><!]*[A-Za-z]").unwrap_or_else(|e| panic!("{e}")));
// DEC private modes, e.g. bracketed paste on/off
static DEC_PRIVATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[\?[0-9;]*[hl]").unwrap_or_else(|e| panic!("{e}")));
// OSC: ESC ] ... terminated by BEL or ST (ESC \)
static OSC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").unwrap_or_else(|e| panic!("{e}"))
});

/// Removes terminal escape sequences and control noise for display.
///
/// This is not terminal emulation: cursor movement is dropped rather than
/// applied. Carriage returns become line feeds, and control characters other
/// than tab and newline are removed.
pub fn strip_ansi(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let out = OSC_RE.replace_all(text, "");
    let out = DEC_PRIVATE_RE.replace_all(&out, "");
    let out = CSI_RE.replace_all(&out, "");
    let out = normalize_line_endings(&out.replace('\x1b', ""));
    out.chars()
        .filter(|&ch| ch == '\n' || ch == '\t' || ch >= ' ')
        .collect()
}

/// Normalizes CRLF and lone CR to LF.
pub fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// The last `lines` newline-terminated segments of `text`; a trailing
/// partial line counts as a segment. `lines <= 0` yields an empty string.
pub fn tail_lines(text: &str, lines: i64) -> String {
    if lines <= 0 {
        return String::new();
    }
    let segments: Vec<&str> = text.split_inclusive('\n').collect();
    let keep = usize::try_from(lines).unwrap_or(usize::MAX);
    if keep >= segments.len() {
        return text.to_string();
    }
    segments[segments.len() - keep..].concat()
}
