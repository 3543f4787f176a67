//! The inside-out encoder.
//!
//! Converts raw wikitext into a string where every innermost construct is a
//! single cookie character. The passes iterate to a fixed point: replacing
//! an inner construct can expose an outer one (the interior of `{{a|{{b}}}}`
//! only matches once `{{b}}` is a cookie), so the loop runs until no pattern
//! matches.
//!
//! Argument references must be encoded before template invocations or the
//! two outer braces of `{{{x}}}` would be claimed as a transclusion, and
//! links must be encoded alongside them because brackets change how braces
//! are interpreted. The missing-brace repairs run only after the principled
//! passes stop matching; unbalanced input is common enough in real dumps
//! that dropping it on the floor is not an option.
//!
//! Termination: every pass either replaces a multi-character construct by a
//! single cookie (strictly reducing the number of unencoded delimiters) or
//! reports no change, and the loop exits on the first full round with no
//! change.

use super::{CookieKind, NOWIKI_SENTINEL, PageContext};
use regex::{Captures, Regex};
use std::{borrow::Cow, sync::LazyLock};

/// Internal links, `[[…]]`, tolerating a nowiki sentinel inside either
/// bracket pair and simple `<…>` tagged spans in the interior.
static LINK: LazyLock<Regex> = LazyLock::new(|| {
    let nw = format!("{NOWIKI_SENTINEL}?");
    Regex::new(&format!(
        r"(?s)\[{nw}\[(([^\[\]{{}}<>]|<[-+*a-zA-Z0-9]*>)+)\]{nw}\]"
    ))
    .unwrap()
});

/// External links and other bracketed spans, `[…]`.
static EXT_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\[([^\[\]{}<>|]+)\]").unwrap());

/// Template argument references, `{{{…}}}`, with an optional nowiki sentinel
/// between any adjacent braces. The interior may contain balanced wikitables
/// `{|…|}`.
static ARG: LazyLock<Regex> = LazyLock::new(|| {
    let nw = format!("{NOWIKI_SENTINEL}?");
    Regex::new(&format!(
        r"(?s)\{{{nw}\{{{nw}\{{(([^{{}}]|\{{\|[^{{}}]*\|\}})*?)\}}{nw}\}}{nw}\}}"
    ))
    .unwrap()
});

/// Argument references missing their final closing brace.
static ARG_REPAIR: LazyLock<Regex> = LazyLock::new(|| {
    let nw = format!("{NOWIKI_SENTINEL}?");
    Regex::new(&format!(
        r"(?s)([^{{])\{{{nw}\{{{nw}\{{([^{{}}]*?)\}}{nw}\}}"
    ))
    .unwrap()
});

/// Template invocations, `{{…}}`. The interior may contain balanced
/// wikitables and a lone `}` not followed by another `}`.
static TEMPLATE: LazyLock<Regex> = LazyLock::new(|| {
    let nw = format!("{NOWIKI_SENTINEL}?");
    Regex::new(&format!(
        r"(?s)\{{{nw}\{{((\{{\|[^{{}}]*?\|\}}|\}}[^{{}}]|[^{{}}](\{{[^{{}}|])?)+?)\}}{nw}\}}"
    ))
    .unwrap()
});

/// Template invocations missing their final closing brace.
static TEMPLATE_REPAIR: LazyLock<Regex> = LazyLock::new(|| {
    let nw = format!("{NOWIKI_SENTINEL}?");
    Regex::new(&format!(
        r"(?s)([^{{])\{{{nw}\{{(([^{{}}]|\{{\|[^{{}}]*\|\}}|\}}[^{{}}])+?)\}}"
    ))
    .unwrap()
});

/// Splits an encoded interior on `|`, skipping pipes inside balanced
/// `<tag>…</tag>` spans of the same tag name.
///
/// Braces are not balanced here; by the time a split happens, inner braces
/// are already cookies.
static VBAR: LazyLock<fancy_regex::Regex> = LazyLock::new(|| {
    fancy_regex::Regex::new(r"(?si)\|((<\s*([-a-zA-Z0-9]+)\b[^>]*>[^\[\]{}]*?<\s*/\s*\3\s*>|[^|])*)")
        .unwrap()
});

/// Encodes all templates, template arguments, links, and parser function
/// calls in `text`, innermost first.
pub(super) fn encode(ctx: &mut PageContext, text: &str) -> String {
    let mut text = super::body::strip_comments(text).into_owned();

    loop {
        let mut changed = false;

        // Step A: links and argument references, until neither matches.
        loop {
            while let Some(new) = pass(&LINK, &text, |caps| save(ctx, CookieKind::Link, caps)) {
                text = new;
                changed = true;
            }

            let mut step = false;
            if let Some(new) = pass(&EXT_LINK, &text, |caps| save_extlink(ctx, caps)) {
                text = new;
                step = true;
            }
            if let Some(new) = pass(&ARG, &text, |caps| save(ctx, CookieKind::ArgRef, caps)) {
                text = new;
                step = true;
            }

            if !step {
                // Repairs must run before the template pass below, or the
                // truncated `{{{x}}` would be claimed as a transclusion.
                if let Some(new) = pass(&ARG_REPAIR, &text, |caps| {
                    save_repaired(ctx, CookieKind::ArgRef, caps)
                }) {
                    text = new;
                } else {
                    break;
                }
            }
            changed = true;
        }

        // Step B: template invocations.
        if let Some(new) = pass(&TEMPLATE, &text, |caps| {
            save(ctx, CookieKind::Template, caps)
        }) {
            text = new;
            continue;
        }
        if changed {
            continue;
        }
        if let Some(new) = pass(&TEMPLATE_REPAIR, &text, |caps| {
            save_repaired(ctx, CookieKind::Template, caps)
        }) {
            text = new;
            continue;
        }

        break;
    }

    text
}

/// Runs a single `replace_all` pass, returning the new text only if anything
/// matched.
fn pass(
    re: &Regex,
    text: &str,
    repl: impl FnMut(&Captures<'_>) -> String,
) -> Option<String> {
    match re.replace_all(text, repl) {
        Cow::Borrowed(_) => None,
        Cow::Owned(new) => Some(new),
    }
}

/// Replacement for templates, argument references, and links.
fn save(ctx: &mut PageContext, kind: CookieKind, caps: &Captures<'_>) -> String {
    let nowiki = caps[0].contains(NOWIKI_SENTINEL);
    let args = vbar_split(&caps[1]);
    cookie_str(ctx.save_cookie(kind, args, nowiki))
}

/// Replacement for external links. The whole interior is a single argument.
fn save_extlink(ctx: &mut PageContext, caps: &Captures<'_>) -> String {
    let nowiki = caps[0].contains(NOWIKI_SENTINEL);
    let args = vec![caps[1].to_string()];
    cookie_str(ctx.save_cookie(CookieKind::ExtLink, args, nowiki))
}

/// Replacement for constructs repaired by adding a missing closing brace,
/// keeping the character preceding the construct.
fn save_repaired(ctx: &mut PageContext, kind: CookieKind, caps: &Captures<'_>) -> String {
    let nowiki = caps[0].contains(NOWIKI_SENTINEL);
    let prefix = &caps[1];
    let args = vbar_split(&caps[2]);

    let what = if kind == CookieKind::ArgRef {
        "template arg"
    } else {
        "template"
    };
    ctx.debug(&format!(
        "heuristically added missing }}}} to {what} {}",
        args.first().map_or("", |arg| arg.trim())
    ));

    format!("{prefix}{}", cookie_str(ctx.save_cookie(kind, args, nowiki)))
}

/// Renders an optional cookie character, with table overflow becoming the
/// empty string.
pub(super) fn cookie_str(cookie: Option<char>) -> String {
    cookie.map(String::from).unwrap_or_default()
}

/// Splits an interior on unescaped pipes. See [`VBAR`].
pub(super) fn vbar_split(v: &str) -> Vec<String> {
    let text = format!("|{v}");
    let mut args = vec![];
    for caps in VBAR.captures_iter(&text) {
        match caps {
            Ok(caps) => args.push(caps.get(1).map_or("", |m| m.as_str()).to_string()),
            Err(err) => {
                // Backtracking blew up on pathological input. A plain split
                // mis-handles pipes inside tags but keeps the page alive.
                log::debug!("pipe split fell back to plain splitting: {err}");
                return v.split('|').map(str::to_string).collect();
            }
        }
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expand::{Cookie, tests::page_context};

    fn load<'c>(ctx: &'c PageContext, encoded: &str) -> &'c Cookie {
        let ch = encoded.chars().next().expect("an encoded character");
        let index = crate::expand::cookie_index(ch).expect("a cookie character");
        ctx.load_cookie(index).expect("a saved cookie")
    }

    #[test]
    fn test_vbar_split() {
        assert_eq!(vbar_split("a|b|c"), ["a", "b", "c"]);
        assert_eq!(vbar_split(""), [""]);
        assert_eq!(vbar_split("a||c"), ["a", "", "c"]);
        assert_eq!(
            vbar_split("a|<span x>p|q</span>|c"),
            ["a", "<span x>p|q</span>", "c"],
            "pipes inside balanced tags should not split"
        );
    }

    #[test]
    fn test_template() {
        let mut ctx = page_context(&[]);
        let encoded = ctx.encode("{{T|a|b}}");
        assert_eq!(encoded.chars().count(), 1, "one construct, one cookie");
        let cookie = load(&ctx, &encoded);
        assert_eq!(cookie.kind, crate::expand::CookieKind::Template);
        assert_eq!(cookie.args, ["T", "a", "b"]);
        assert!(!cookie.nowiki);
    }

    #[test]
    fn test_nested_inside_out() {
        let mut ctx = page_context(&[]);
        let encoded = ctx.encode("{{a|{{b}}}}");
        assert_eq!(encoded.chars().count(), 1);
        let outer = load(&ctx, &encoded);
        assert_eq!(outer.args[0], "a");
        let inner = load(&ctx, &outer.args[1]);
        assert_eq!(inner.args, ["b"], "the inner template encodes first");
    }

    #[test]
    fn test_interning_in_encode() {
        let mut ctx = page_context(&[]);
        let encoded = ctx.encode("{{a}} and {{a}}");
        let chars = encoded
            .chars()
            .filter(|&c| crate::expand::cookie_index(c).is_some())
            .collect::<Vec<_>>();
        assert_eq!(chars.len(), 2);
        assert_eq!(chars[0], chars[1], "equal constructs share one cookie");
    }

    #[test]
    fn test_argument_before_template() {
        let mut ctx = page_context(&[]);
        let encoded = ctx.encode("{{{{x}}}}");
        let chars = encoded.chars().collect::<Vec<_>>();
        assert_eq!(chars.len(), 3, "expected a brace, a cookie, and a brace");
        assert_eq!(chars[0], '{');
        assert_eq!(chars[2], '}');
        let cookie = load(&ctx, &encoded[1..]);
        assert_eq!(
            cookie.kind,
            crate::expand::CookieKind::ArgRef,
            "the inner braces read as an argument reference first"
        );
    }

    #[test]
    fn test_links() {
        let mut ctx = page_context(&[]);
        let encoded = ctx.encode("[[Page|label]] and [https://x ref]");
        let mut cookies = encoded
            .chars()
            .filter_map(crate::expand::cookie_index)
            .map(|index| ctx.load_cookie(index).unwrap().clone());
        let link = cookies.next().unwrap();
        assert_eq!(link.kind, crate::expand::CookieKind::Link);
        assert_eq!(link.args, ["Page", "label"]);
        let ext = cookies.next().unwrap();
        assert_eq!(ext.kind, crate::expand::CookieKind::ExtLink);
        assert_eq!(ext.args, ["https://x ref"]);
    }

    #[test]
    fn test_nowiki_sentinel_flags_cookie() {
        let mut ctx = page_context(&[]);
        let text = format!("{{{NOWIKI_SENTINEL}{{T}}}}");
        let encoded = ctx.encode(&text);
        let cookie = load(&ctx, &encoded);
        assert!(cookie.nowiki, "a sentinel inside the delimiters marks the cookie");
    }

    #[test]
    fn test_template_repair() {
        let mut ctx = page_context(&[]);
        let encoded = ctx.encode("a{{foo} b");
        assert!(encoded.starts_with('a'), "the preceding character survives");
        let cookie = load(&ctx, &encoded[1..]);
        assert_eq!(cookie.kind, crate::expand::CookieKind::Template);
        assert_eq!(cookie.args, ["foo"]);
    }

    #[test]
    fn test_arg_repair() {
        let mut ctx = page_context(&[]);
        let encoded = ctx.encode("x{{{1}} y");
        let cookie = load(&ctx, &encoded[1..]);
        assert_eq!(cookie.kind, crate::expand::CookieKind::ArgRef);
        assert_eq!(cookie.args, ["1"]);
    }

    #[test]
    fn test_comments_stripped() {
        let mut ctx = page_context(&[]);
        assert_eq!(ctx.encode("a<!-- gone -->b"), "ab");
    }

    #[test]
    fn test_plain_text_untouched() {
        let mut ctx = page_context(&[]);
        assert_eq!(ctx.encode("no constructs here"), "no constructs here");
    }
}
