//! Text normalization applied to free-text product fields before indexing.

use std::sync::LazyLock;

use regex::Regex;
use scraper::Html;

/// Control and format characters (zero-width spaces, BOMs, stray escapes).
static CONTROL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{Cc}\p{Cf}]").expect("valid regex"));

static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Strip markup, drop control characters and collapse whitespace.
///
/// HTML entities are decoded as part of markup stripping.
pub fn clean_text(input: &str) -> String {
    let text = if input.contains('<') || input.contains('&') {
        let fragment = Html::parse_fragment(input);
        fragment
            .root_element()
            .text()
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        input.to_string()
    };

    let text = CONTROL_CHARS.replace_all(&text, " ");
    WHITESPACE_RUN.replace_all(&text, " ").trim().to_string()
}

/// [`clean_text`] for optional fields. Empty results become `None`.
pub fn clean_optional(input: Option<&str>) -> Option<String> {
    input.map(clean_text).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markup_and_entities() {
        assert_eq!(
            clean_text("<p>Fresh <b>Alphonso</b> &amp; Kesar</p>"),
            "Fresh Alphonso & Kesar"
        );
    }

    #[test]
    fn collapses_whitespace_and_controls() {
        assert_eq!(clean_text("  Basmati\t\n  Rice\u{200b}5kg "), "Basmati Rice 5kg");
        assert_eq!(clean_text("a\u{0007}b"), "a b");
    }

    #[test]
    fn plain_text_unchanged() {
        assert_eq!(clean_text("Alphonso Mango"), "Alphonso Mango");
    }

    #[test]
    fn optional_empty_becomes_none() {
        assert_eq!(clean_optional(Some("  <br/> ")), None);
        assert_eq!(clean_optional(None), None);
        assert_eq!(clean_optional(Some("ok")), Some("ok".to_string()));
    }
}
