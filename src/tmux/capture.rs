use once_cell::sync::Lazy;
use regex::Regex;

/// Line printed after a dispatched command exits, followed by its status
pub const EXIT_MARKER: &str = "__TMUX_SSH_EXIT:";

/// Tail of the line typed into the pane; its echo is never command output
pub const MARKER_ECHO: &str = "echo \"__TMUX_SSH_EXIT:$?\"";

/// Matches only a marker line the shell actually printed; the typed command
/// line holds a literal `$?` and never matches.
static RE_EXIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^__TMUX_SSH_EXIT:(\d+)\s*$").unwrap());

static RE_TRAILING_BLANK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+\z").unwrap());

/// Pane content after normalization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capture {
    /// Visible output with marker lines, the typed command line and trailing
    /// blank lines removed
    pub text: String,
    /// Status reported by the most recent exit marker
    pub exit_code: Option<i32>,
}

impl Capture {
    /// Normalize raw `capture-pane` output
    pub fn parse(raw: &str) -> Self {
        let exit_code = RE_EXIT
            .captures_iter(raw)
            .last()
            .and_then(|c| c[1].parse().ok());

        let text = raw
            .lines()
            .filter(|line| {
                !RE_EXIT.is_match(line) && !line.trim_end().ends_with(MARKER_ECHO)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let text = RE_TRAILING_BLANK.replace(&text, "").into_owned();

        Self { text, exit_code }
    }
}

/// Byte length of the longest common prefix, on a char boundary
pub fn common_prefix_len(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .find(|((_, ca), cb)| ca != cb)
        .map(|((i, _), _)| i)
        .unwrap_or_else(|| a.len().min(b.len()))
}
