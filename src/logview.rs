//! ANSI log rendering for browser display.
//!
//! Agents emit log lines with ANSI SGR color sequences and a leading
//! timestamp. These helpers turn SGR runs into span markup and strip the
//! time prefix; they are pure rendering and carry no pipeline semantics.

/// Map an ANSI-colored log line to HTML span markup.
///
/// Recognized SGR codes: reset (0), bold (1), underline (4), the standard
/// foreground colors (30-37) and their bright variants (90-97). Unknown
/// codes are dropped. Text content is HTML-escaped.
pub fn render_ansi_line(line: &str) -> String {
    let line = strip_time_prefix(line);
    let mut out = String::with_capacity(line.len());
    let mut open_spans = 0usize;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            if chars.peek() == Some(&'[') {
                chars.next();
                let mut params = String::new();
                let mut is_sgr = false;
                for c in chars.by_ref() {
                    if c == 'm' {
                        is_sgr = true;
                        break;
                    }
                    if c.is_ascii_digit() || c == ';' {
                        params.push(c);
                    } else {
                        // Not an SGR sequence; drop it entirely.
                        break;
                    }
                }
                if !is_sgr {
                    continue;
                }
                for code in params.split(';') {
                    match sgr_class(code) {
                        SgrAction::Reset => {
                            while open_spans > 0 {
                                out.push_str("</span>");
                                open_spans -= 1;
                            }
                        }
                        SgrAction::Open(class) => {
                            out.push_str("<span class=\"");
                            out.push_str(class);
                            out.push_str("\">");
                            open_spans += 1;
                        }
                        SgrAction::Ignore => {}
                    }
                }
            }
            continue;
        }
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            _ => out.push(c),
        }
    }

    while open_spans > 0 {
        out.push_str("</span>");
        open_spans -= 1;
    }

    out
}

/// Remove every ANSI escape sequence from a line.
pub fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            if chars.peek() == Some(&'[') {
                chars.next();
                for c in chars.by_ref() {
                    if c.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

/// Strip a leading `YYYY-MM-DD HH:MM:SS` or `YYYY/MM/DD HH:MM:SS` prefix
/// (with optional fractional seconds) from a log line.
pub fn strip_time_prefix(line: &str) -> &str {
    let bytes = line.as_bytes();

    let is_date = |b: &[u8]| {
        b.len() >= 10
            && b[..4].iter().all(u8::is_ascii_digit)
            && (b[4] == b'-' || b[4] == b'/')
            && b[5..7].iter().all(u8::is_ascii_digit)
            && b[7] == b[4]
            && b[8..10].iter().all(u8::is_ascii_digit)
    };

    if !is_date(bytes) {
        return line;
    }

    let rest = &bytes[10..];
    let is_time = |b: &[u8]| {
        b.len() >= 9
            && b[0] == b' '
            && b[1..3].iter().all(u8::is_ascii_digit)
            && b[3] == b':'
            && b[4..6].iter().all(u8::is_ascii_digit)
            && b[6] == b':'
            && b[7..9].iter().all(u8::is_ascii_digit)
    };

    if !is_time(rest) {
        return line;
    }

    let mut idx = 19;
    // Optional fractional seconds.
    if bytes.get(idx) == Some(&b'.') {
        idx += 1;
        while bytes.get(idx).is_some_and(u8::is_ascii_digit) {
            idx += 1;
        }
    }
    // Swallow the separating whitespace.
    while bytes.get(idx) == Some(&b' ') {
        idx += 1;
    }

    &line[idx..]
}

enum SgrAction {
    Reset,
    Open(&'static str),
    Ignore,
}

fn sgr_class(code: &str) -> SgrAction {
    match code {
        "" | "0" => SgrAction::Reset,
        "1" => SgrAction::Open("ansi-bold"),
        "4" => SgrAction::Open("ansi-underline"),
        "30" => SgrAction::Open("ansi-black"),
        "31" => SgrAction::Open("ansi-red"),
        "32" => SgrAction::Open("ansi-green"),
        "33" => SgrAction::Open("ansi-yellow"),
        "34" => SgrAction::Open("ansi-blue"),
        "35" => SgrAction::Open("ansi-magenta"),
        "36" => SgrAction::Open("ansi-cyan"),
        "37" => SgrAction::Open("ansi-white"),
        "90" => SgrAction::Open("ansi-bright-black"),
        "91" => SgrAction::Open("ansi-bright-red"),
        "92" => SgrAction::Open("ansi-bright-green"),
        "93" => SgrAction::Open("ansi-bright-yellow"),
        "94" => SgrAction::Open("ansi-bright-blue"),
        "95" => SgrAction::Open("ansi-bright-magenta"),
        "96" => SgrAction::Open("ansi-bright-cyan"),
        "97" => SgrAction::Open("ansi-bright-white"),
        _ => SgrAction::Ignore,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_color_runs_as_spans() {
        let line = "\x1b[32mINFO\x1b[0m started";
        assert_eq!(
            render_ansi_line(line),
            "<span class=\"ansi-green\">INFO</span> started"
        );
    }

    #[test]
    fn unclosed_span_is_closed_at_end() {
        let line = "\x1b[31merror without reset";
        assert_eq!(
            render_ansi_line(line),
            "<span class=\"ansi-red\">error without reset</span>"
        );
    }

    #[test]
    fn strips_time_prefix_variants() {
        assert_eq!(
            strip_time_prefix("2025/06/15 11:09:19 INFO ready"),
            "INFO ready"
        );
        assert_eq!(
            strip_time_prefix("2025-06-15 11:09:19.123 listening"),
            "listening"
        );
        assert_eq!(strip_time_prefix("no timestamp here"), "no timestamp here");
    }

    #[test]
    fn escapes_html() {
        assert_eq!(render_ansi_line("a <b> & c"), "a &lt;b&gt; &amp; c");
    }

    #[test]
    fn strip_ansi_removes_sequences() {
        assert_eq!(strip_ansi("\x1b[1;32mbold green\x1b[0m"), "bold green");
    }

    #[test]
    fn unknown_codes_ignored() {
        assert_eq!(render_ansi_line("\x1b[38;5;208mtext\x1b[0m"), "text");
    }
}
