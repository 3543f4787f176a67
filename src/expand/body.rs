//! Template body normalization.
//!
//! A template page is not transcluded verbatim. Inclusion-control tags
//! rewrite the body at transclusion time: `<noinclude>` regions disappear,
//! `<includeonly>` tags (but not their content) disappear, and when any
//! `<onlyinclude>` region exists it replaces the entire body. Bodies are
//! normalized once at ingest time since each template is typically
//! transcluded many times.

use regex::Regex;
use std::sync::LazyLock;

/// HTML comments, non-greedy across newlines.
static COMMENTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!\s*--.*?--\s*>").unwrap());

/// Closed `<noinclude>…</noinclude>` regions.
static NOINCLUDE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<\s*noinclude\s*>.*?<\s*/\s*noinclude\s*>").unwrap());

/// An unclosed `<noinclude>` through the end of the body.
static NOINCLUDE_UNCLOSED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<\s*noinclude\s*>.*").unwrap());

/// An unclosed `<!--` through the end of the body.
static COMMENT_UNCLOSED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!\s*--.*").unwrap());

/// `<onlyinclude>…</onlyinclude>` regions and self-closing `<onlyinclude/>`.
static ONLYINCLUDE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<\s*onlyinclude\s*>(.*?)<\s*/\s*onlyinclude\s*>|<\s*onlyinclude\s*/\s*>")
        .unwrap()
});

/// `<includeonly>` and `</includeonly>` tags.
static INCLUDEONLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<\s*(/\s*)?includeonly\s*(/\s*)?>").unwrap());

/// Removes all closed HTML comments.
pub(super) fn strip_comments(text: &str) -> std::borrow::Cow<'_, str> {
    COMMENTS.replace_all(text, "")
}

/// Extracts the portion of a template page that is transcluded.
///
/// Self-closing `<noinclude/>` is deliberately left in place. It is used as
/// a wedge between brackets to defeat link interpretation, and is stripped
/// by the expander during template-name evaluation instead.
pub(crate) fn transclusion_body(text: &str) -> String {
    let text = COMMENTS.replace_all(text, "");
    let text = NOINCLUDE.replace_all(&text, "");
    let text = NOINCLUDE_UNCLOSED.replace_all(&text, "");
    let text = COMMENT_UNCLOSED.replace_all(&text, "").into_owned();

    let onlys = ONLYINCLUDE
        .captures_iter(&text)
        .map(|caps| caps.get(1).map_or("", |m| m.as_str()))
        .collect::<Vec<_>>();
    let text = if onlys.is_empty() {
        text
    } else {
        onlys.concat()
    };

    INCLUDEONLY.replace_all(&text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noinclude_and_includeonly() {
        assert_eq!(
            transclusion_body("<noinclude>hide</noinclude>keep<includeonly>show</includeonly>"),
            "keepshow",
            "noinclude content goes, includeonly tags go but content stays"
        );
    }

    #[test]
    fn test_unclosed_noinclude() {
        assert_eq!(
            transclusion_body("keep<noinclude>gone to the end"),
            "keep",
            "an unclosed noinclude discards the rest of the body"
        );
    }

    #[test]
    fn test_comments() {
        assert_eq!(transclusion_body("a<!-- x\ny -->b"), "ab");
        assert_eq!(
            transclusion_body("a<!-- unclosed"),
            "a",
            "an unclosed trailing comment is dropped"
        );
    }

    #[test]
    fn test_onlyinclude() {
        assert_eq!(
            transclusion_body("junk<onlyinclude>a</onlyinclude>junk<onlyinclude>b</onlyinclude>!"),
            "ab",
            "onlyinclude regions replace the whole body"
        );
        assert_eq!(
            transclusion_body("junk<onlyinclude/>junk"),
            "",
            "a self-closing onlyinclude contributes nothing but still wins"
        );
    }

    #[test]
    fn test_case_and_whitespace_tolerance() {
        assert_eq!(
            transclusion_body("< NoInclude >x</ noinclude >y"),
            "y",
            "tag names tolerate case and whitespace"
        );
    }

    #[test]
    fn test_self_closing_noinclude_survives() {
        assert_eq!(
            transclusion_body("a<noinclude/>b"),
            "a<noinclude/>b",
            "self-closing noinclude is not this pass's business"
        );
    }
}
