//! Splitting combined process output into a document block and log text
//!
//! A script may print one HTML document delimited by `<!DOCTYPE html>` and
//! `</html>`. Markers are matched case-insensitively across lines and the
//! shortest block wins. Only the first block is extracted; any later blocks
//! stay in the residual text as plain output.

use once_cell::sync::Lazy;
use regex::Regex;

static DOCUMENT_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<!DOCTYPE html>.*?</html>").unwrap_or_else(|e| {
        unreachable!("document block pattern is a literal: {e}")
    })
});

/// Output of a run split into its rendered and textual parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Separated {
    /// The first complete document block, verbatim
    pub document: Option<String>,
    /// Everything else, trimmed
    pub residual: String,
}

/// Split `text` into the first document block and the remaining text
#[must_use]
pub fn separate(text: &str) -> Separated {
    match DOCUMENT_BLOCK.find(text) {
        Some(found) => {
            let mut residual = String::with_capacity(text.len());
            residual.push_str(&text[..found.start()]);
            residual.push_str(&text[found.end()..]);
            Separated {
                document: Some(found.as_str().to_owned()),
                residual: residual.trim().to_owned(),
            }
        }
        None => Separated {
            document: None,
            residual: text.trim().to_owned(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_followed_by_logs() {
        let out = separate("<!DOCTYPE html><html>X</html>\nLOG1\nLOG2");
        assert_eq!(out.document.as_deref(), Some("<!DOCTYPE html><html>X</html>"));
        assert_eq!(out.residual, "LOG1\nLOG2");
    }

    #[test]
    fn no_markers() {
        let out = separate("LOG1\nLOG2");
        assert_eq!(out.document, None);
        assert_eq!(out.residual, "LOG1\nLOG2");
    }

    #[test]
    fn plain_text_is_trimmed() {
        let out = separate("\n  hi\n\n");
        assert_eq!(out.document, None);
        assert_eq!(out.residual, "hi");
    }

    #[test]
    fn block_spans_lines_and_keeps_quotes() {
        let text = "before\n<!DOCTYPE html>\n<html><body class=\"a 'b'\">\n<p>x</p>\n</body></html>\nafter";
        let out = separate(text);
        assert_eq!(
            out.document.as_deref(),
            Some("<!DOCTYPE html>\n<html><body class=\"a 'b'\">\n<p>x</p>\n</body></html>")
        );
        assert_eq!(out.residual, "before\n\nafter");
    }

    #[test]
    fn markers_match_case_insensitively() {
        let out = separate("<!doctype HTML><HTML>y</HTML> tail");
        assert_eq!(out.document.as_deref(), Some("<!doctype HTML><HTML>y</HTML>"));
        assert_eq!(out.residual, "tail");
    }

    #[test]
    fn only_the_first_block_is_extracted() {
        let text = "<!DOCTYPE html><html>1</html>\nmid\n<!DOCTYPE html><html>2</html>";
        let out = separate(text);
        assert_eq!(out.document.as_deref(), Some("<!DOCTYPE html><html>1</html>"));
        assert_eq!(out.residual, "mid\n<!DOCTYPE html><html>2</html>");
    }

    #[test]
    fn malformed_inner_markup_passes_through() {
        let out = separate("<!DOCTYPE html><html><div><span></html>");
        assert_eq!(out.document.as_deref(), Some("<!DOCTYPE html><html><div><span></html>"));
        assert_eq!(out.residual, "");
    }

    #[test]
    fn unterminated_block_is_plain_text() {
        let out = separate("<!DOCTYPE html><html>never closed\n");
        assert_eq!(out.document, None);
        assert_eq!(out.residual, "<!DOCTYPE html><html>never closed");
    }

    #[test]
    fn empty_input() {
        let out = separate("");
        assert_eq!(out.document, None);
        assert_eq!(out.residual, "");
    }
}
