use std::sync::LazyLock;

use regex::Regex;

// CSI (7-bit and 8-bit introducers), OSC terminated by BEL or ST, then any
// remaining two-byte escape.
static ESCAPE_SEQUENCES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?:\x1b\[|\u{9b})[0-?]*[ -/]*[@-~]",
        r"|(?:\x1b\]|\u{9d})[^\x07\x1b\u{9c}\n]*(?:\x07|\x1b\\|\u{9c})?",
        r"|\x1b[ -/]*[0-~]",
    ))
    .expect("escape sequence pattern is valid")
});

/// Strips terminal escape sequences and control characters from captured
/// program output, keeping newlines and tabs.
pub fn sanitize(text: &str) -> String {
    let stripped = ESCAPE_SEQUENCES.replace_all(text, "");
    stripped
        .chars()
        .filter(|c| !is_stripped_control(*c))
        .collect::<String>()
        .trim()
        .to_string()
}

fn is_stripped_control(c: char) -> bool {
    match c {
        '\n' | '\t' => false,
        '\u{0}'..='\u{1f}' | '\u{7f}'..='\u{9f}' => true,
        _ => false,
    }
}
