//! The outside-in expander and the finalizer.
//!
//! Expansion happens in two passes over a cookie-bearing string. Pass one,
//! [`expand_args`], substitutes argument references against the active
//! frame; it runs over template bodies after transclusion. Pass two,
//! [`expand_recur`], walks cookies outside-in and performs the actual
//! transclusion, parser function dispatch, and sandbox invocation. The
//! [`finalize_expand`] step re-serialises whatever survives back into
//! literal wikitext, so malformed or filtered input degrades to its original
//! written form instead of leaking placeholder codepoints.

use super::{
    ArgKey, ArgMap, CookieKind, Frame, NOWIKI_SENTINEL, PageContext, body, cookie_index,
    encoder::{self, cookie_str},
    parser_fns,
};
use crate::common::collapse_whitespace;
use regex::{Captures, Regex};
use std::{sync::LazyLock, time::Duration};

/// Paired `<nowiki>…</nowiki>` regions.
static NOWIKI_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?si)<\s*nowiki\s*>(.*?)<\s*/\s*nowiki\s*>").unwrap());

/// Self-closing `<nowiki/>` markers.
static NOWIKI_SELF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?si)<\s*nowiki\s*/\s*>").unwrap());

/// Self-closing `<noinclude/>` wedges inside template names.
static NOINCLUDE_SELF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<\s*noinclude\s*/\s*>").unwrap());

/// A `key = value` template argument. The key may not contain characters
/// that would have encoded differently, and surrounding whitespace belongs
/// to the syntax, not the name or value.
static NAMED_ARG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)^\s*([^\[\]&<>="']+?)\s*=\s*(.*?)\s*$"#).unwrap());

/// Fully expands `text`: encodes it, expands templates and parser functions
/// recursively, and re-serialises whatever must remain unexpanded.
pub fn expand(
    ctx: &mut PageContext,
    text: &str,
    parent: Option<&Frame>,
    timeout: Option<Duration>,
) -> String {
    let text = preprocess_text(ctx, text);
    let encoded = encoder::encode(ctx, &text);
    let expanded = expand_recur(ctx, &encoded, parent, timeout);
    finalize_expand(ctx, &expanded)
}

/// Escapes `<nowiki>` regions into cookies, turns `<nowiki/>` markers into
/// the sentinel codepoint, and strips comments.
fn preprocess_text(ctx: &mut PageContext, text: &str) -> String {
    let text = NOWIKI_PAIR.replace_all(text, |caps: &Captures<'_>| {
        cookie_str(ctx.save_cookie(CookieKind::Nowiki, vec![caps[1].to_string()], false))
    });
    let sentinel = NOWIKI_SENTINEL.to_string();
    let text = NOWIKI_SELF.replace_all(&text, sentinel.as_str());
    body::strip_comments(&text).into_owned()
}

/// Substitutes argument references in `coded` against `argmap`.
///
/// Values from the map are emitted verbatim; they were expanded when the
/// frame was built and must not expand again. Template cookies are rebuilt
/// with substituted arguments but stay unexpanded, since arguments resolve
/// in the frame where they are written, not where the template is finally
/// expanded.
pub(crate) fn expand_args(
    ctx: &mut PageContext,
    coded: &str,
    argmap: &ArgMap,
    parent: Option<&Frame>,
    timeout: Option<Duration>,
) -> String {
    let mut parts = String::with_capacity(coded.len());
    let mut pos = 0;

    for (start, ch, index) in cookie_chars(coded) {
        parts.push_str(&coded[pos..start]);
        pos = start + ch.len_utf8();

        let Some(cookie) = ctx.load_cookie(index).cloned() else {
            ctx.error(&format!("expand_args: unknown cookie {index}"));
            parts.push(ch);
            continue;
        };

        if cookie.nowiki {
            // Marked "do not expand"; the finalizer will deal with it.
            parts.push(ch);
            continue;
        }

        match cookie.kind {
            CookieKind::Template => {
                let new_args = cookie
                    .args
                    .iter()
                    .map(|arg| expand_args(ctx, arg, argmap, parent, timeout))
                    .collect();
                parts.push_str(&cookie_str(ctx.save_cookie(
                    CookieKind::Template,
                    new_args,
                    cookie.nowiki,
                )));
            }
            CookieKind::ArgRef => {
                if cookie.args.len() > 3 {
                    ctx.debug(&format!(
                        "too many args ({}) in argument reference: {:?}",
                        cookie.args.len(),
                        cookie.args
                    ));
                }

                ctx.expand_stack.push("ARG-NAME".to_string());
                let name = expand_args(
                    ctx,
                    cookie.args.first().map_or("", String::as_str),
                    argmap,
                    parent,
                    timeout,
                );
                let name = expand_recur(ctx, &name, parent, timeout);
                ctx.expand_stack.pop();

                let name = name.trim();
                let key = if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
                    name.parse::<u32>()
                        .map_or_else(|_| ArgKey::Name(collapse_whitespace(name)), ArgKey::Num)
                } else {
                    ArgKey::Name(collapse_whitespace(name))
                };

                if let Some(value) = argmap.get(&key) {
                    parts.push_str(value);
                } else if cookie.args.len() >= 2 {
                    ctx.expand_stack.push("ARG-DEFVAL".to_string());
                    let default = expand_args(ctx, &cookie.args[1], argmap, parent, timeout);
                    ctx.expand_stack.pop();
                    parts.push_str(&default);
                } else {
                    // Not defined in this frame; reconstitute the reference.
                    parts.push_str(&unexpanded_arg(&[key.to_string()], cookie.nowiki));
                }
            }
            CookieKind::Link => {
                let new_args = cookie
                    .args
                    .iter()
                    .map(|arg| expand_args(ctx, arg, argmap, parent, timeout))
                    .collect::<Vec<_>>();
                parts.push_str(&unexpanded_link(&new_args, cookie.nowiki));
            }
            CookieKind::ExtLink => {
                let new_args = cookie
                    .args
                    .iter()
                    .map(|arg| expand_args(ctx, arg, argmap, parent, timeout))
                    .collect::<Vec<_>>();
                parts.push_str(&unexpanded_extlink(&new_args, cookie.nowiki));
            }
            CookieKind::Nowiki => parts.push(ch),
        }
    }

    parts.push_str(&coded[pos..]);
    parts
}

/// Expands templates, parser functions, and links in `coded`, outside-in.
pub(crate) fn expand_recur(
    ctx: &mut PageContext,
    coded: &str,
    parent: Option<&Frame>,
    timeout: Option<Duration>,
) -> String {
    let mut parts = String::with_capacity(coded.len());
    let mut pos = 0;

    for (start, ch, index) in cookie_chars(coded) {
        parts.push_str(&coded[pos..start]);
        pos = start + ch.len_utf8();

        if !ctx.has_cookie(index) {
            // A stray magic character from the input; leave it alone.
            parts.push(ch);
            continue;
        }
        let cookie = ctx
            .load_cookie(index)
            .cloned()
            .expect("load is infallible below the table size");

        match cookie.kind {
            CookieKind::Template => {
                if cookie.nowiki {
                    parts.push_str(&unexpanded_template(&cookie.args, true));
                    continue;
                }

                // The expand stack counts every recursive entry, so the
                // bound corresponds to total nested work, not call frames.
                if ctx.expand_stack.len() >= 100 {
                    ctx.error("recursion too deep during template expansion");
                    parts.push_str(&format!(
                        "<strong class='error'>too deep recursion while expanding template {}</strong>",
                        unexpanded_template(&cookie.args, true)
                    ));
                    continue;
                }

                parts.push_str(&expand_template_cookie(
                    ctx,
                    &cookie.args,
                    cookie.nowiki,
                    parent,
                    timeout,
                ));
            }
            // Argument references only resolve in pass one; anything that
            // survives to this point is outside any frame.
            CookieKind::ArgRef => {
                parts.push_str(&unexpanded_arg(&cookie.args, cookie.nowiki));
            }
            CookieKind::Link => {
                if cookie.nowiki {
                    parts.push_str(&unexpanded_link(&cookie.args, true));
                } else {
                    ctx.expand_stack.push("[[link]]".to_string());
                    let new_args = cookie
                        .args
                        .iter()
                        .map(|arg| expand_recur(ctx, arg, parent, timeout))
                        .collect::<Vec<_>>();
                    ctx.expand_stack.pop();
                    parts.push_str(&unexpanded_link(&new_args, false));
                }
            }
            CookieKind::ExtLink => {
                if cookie.nowiki {
                    parts.push_str(&unexpanded_extlink(&cookie.args, true));
                } else {
                    ctx.expand_stack.push("[extlink]".to_string());
                    let new_args = cookie
                        .args
                        .iter()
                        .map(|arg| expand_recur(ctx, arg, parent, timeout))
                        .collect::<Vec<_>>();
                    ctx.expand_stack.pop();
                    parts.push_str(&unexpanded_extlink(&new_args, false));
                }
            }
            CookieKind::Nowiki => parts.push(ch),
        }
    }

    parts.push_str(&coded[pos..]);
    parts
}

/// Expands one template (or parser function) cookie.
fn expand_template_cookie(
    ctx: &mut PageContext,
    args: &[String],
    nowiki: bool,
    parent: Option<&Frame>,
    timeout: Option<Duration>,
) -> String {
    let name_data = ctx.name_data();
    let rest = args.get(1..).unwrap_or(&[]);

    // The name may itself be generated, so expand it first.
    ctx.expand_stack.push("TEMPLATE_NAME".to_string());
    let tname = expand_recur(
        ctx,
        args.first().map_or("", String::as_str),
        parent,
        timeout,
    );
    ctx.expand_stack.pop();

    // `<noinclude/>` appears between braces as a wedge against normal
    // interpretation; it contributes nothing to the name.
    let tname = NOINCLUDE_SELF.replace_all(&tname, "");
    let mut tname = tname.trim();
    if let Some(stripped) = strip_prefix_ignore_ascii_case(tname, "safesubst:") {
        tname = stripped;
    } else if let Some(stripped) = strip_prefix_ignore_ascii_case(tname, "subst:") {
        tname = stripped;
    }
    let tname = tname.to_string();

    // Parser function call with explicit `{{name:arg|…}}` syntax.
    if let Some(ofs) = tname.find(':')
        && ofs > 0
    {
        let fn_name = name_data.canonicalize_parserfn_name(&tname[..ofs]);
        if parser_fns::is_parser_fn(&fn_name) || fn_name.starts_with('#') {
            let mut fn_args = Vec::with_capacity(rest.len() + 1);
            fn_args.push(tname[ofs + 1..].trim_start().to_string());
            fn_args.extend_from_slice(rest);
            return expand_parser_fn(ctx, &fn_name, &fn_args, parent, timeout);
        }
    }

    // Compatibility: magic words and parser functions also match as a bare
    // template name, with or without further arguments.
    let fn_name = name_data.canonicalize_parserfn_name(&tname);
    if parser_fns::is_parser_fn(&fn_name) || fn_name.starts_with('#') {
        return expand_parser_fn(ctx, &fn_name, rest, parent, timeout);
    }

    let Some(template_body) = ctx.get_template(&tname).filter(|body| !body.is_empty()) else {
        ctx.warning(&format!("undefined template {tname:?}"));
        return format!(
            "<strong class='error'>Template:{}</strong>",
            html_escape::encode_safe(&tname)
        );
    };

    if !ctx.expand_template(&tname) {
        // Still expand the arguments: parser functions inside them may
        // depend on the live parent frame and would misbehave if deferred.
        let new_args = args
            .iter()
            .map(|arg| expand_recur(ctx, arg, parent, timeout))
            .collect::<Vec<_>>();
        return unexpanded_template(&new_args, nowiki);
    }

    // Build the callee frame. Argument values expand in the frame where the
    // call is written; this matters for #invoke inside an argument, whose
    // parent frame would otherwise be wrong.
    ctx.expand_stack.push(tname.clone());
    let mut argmap = ArgMap::new();
    let mut num: u32 = 1;

    for arg in rest {
        let (key, value) = if let Some(caps) = NAMED_ARG.captures(arg) {
            let raw_key = caps.get(1).map_or("", |m| m.as_str());
            let value = caps.get(2).map_or("", |m| m.as_str()).to_string();

            if !raw_key.is_empty() && raw_key.bytes().all(|b| b.is_ascii_digit()) {
                let mut key = raw_key.parse::<u32>().unwrap_or(u32::MAX);
                if key < 1 || key > 1000 {
                    ctx.debug(&format!(
                        "invalid argument number {raw_key} for template {tname:?}"
                    ));
                    key = 1000;
                }
                // An explicit positional key advances the implicit counter.
                if num <= key {
                    num = key + 1;
                }
                (ArgKey::Num(key), value)
            } else {
                ctx.expand_stack.push("ARGNAME".to_string());
                let key = expand_recur(ctx, raw_key, parent, timeout);
                ctx.expand_stack.pop();
                (ArgKey::Name(collapse_whitespace(&key)), value)
            }
        } else {
            let key = num;
            num += 1;
            (ArgKey::Num(key), arg.clone())
        };

        ctx.expand_stack.push(format!("ARGVAL-{key}"));
        let value = expand_recur(ctx, &value, parent, timeout);
        ctx.expand_stack.pop();
        argmap.insert(key, value);
    }

    // A template that begins with a list marker must start its own line to
    // be recognized once inlined.
    let template_body = if template_body.starts_with(['#', '*', ';', ':']) {
        format!("\n{template_body}")
    } else {
        template_body
    };

    let encoded_body = encoder::encode(ctx, &template_body);
    let encoded_body = expand_args(ctx, &encoded_body, &argmap, parent, timeout);

    let mut callee_title = tname.trim().to_string();
    if name_data.get(&callee_title).is_none() {
        callee_title = format!("{}:{callee_title}", name_data.name_of("Template"));
    }

    let frame = Frame {
        title: callee_title,
        args: argmap,
    };
    let expanded = expand_recur(ctx, &encoded_body, Some(&frame), timeout);
    ctx.expand_stack.pop();
    expanded
}

/// Dispatches a recognized parser function, keeping its name on the expand
/// stack for the duration of the call.
fn expand_parser_fn(
    ctx: &mut PageContext,
    fn_name: &str,
    args: &[String],
    parent: Option<&Frame>,
    timeout: Option<Duration>,
) -> String {
    ctx.expand_stack.push(fn_name.to_string());
    let result = parser_fns::call_parser_function(ctx, fn_name, args, parent, timeout);
    ctx.expand_stack.pop();
    result
}

/// Re-serialises any surviving cookies back into literal wikitext and
/// resolves the nowiki sentinel.
///
/// Re-serialised arguments can themselves contain cookies, so this iterates
/// until a pass changes nothing.
pub(crate) fn finalize_expand(ctx: &PageContext, text: &str) -> String {
    let mut text = text.to_string();

    loop {
        let mut changed = false;
        let mut out = String::with_capacity(text.len());
        let mut pos = 0;

        for (start, ch, index) in cookie_chars(&text) {
            out.push_str(&text[pos..start]);
            pos = start + ch.len_utf8();

            if let Some(cookie) = ctx.load_cookie(index) {
                match cookie.kind {
                    CookieKind::Template => {
                        out.push_str(&unexpanded_template(&cookie.args, cookie.nowiki));
                    }
                    CookieKind::ArgRef => {
                        out.push_str(&unexpanded_arg(&cookie.args, cookie.nowiki));
                    }
                    CookieKind::Link => {
                        out.push_str(&unexpanded_link(&cookie.args, cookie.nowiki));
                    }
                    CookieKind::ExtLink => {
                        out.push_str(&unexpanded_extlink(&cookie.args, cookie.nowiki));
                    }
                    CookieKind::Nowiki => {
                        out.push_str("<nowiki>");
                        out.push_str(cookie.args.first().map_or("", String::as_str));
                        out.push_str("</nowiki>");
                    }
                }
                changed = true;
            } else {
                // Keeping the stray character unchanged keeps the loop
                // terminating.
                out.push(ch);
            }
        }

        out.push_str(&text[pos..]);
        text = out;
        if !changed {
            break;
        }
    }

    text.replace(NOWIKI_SENTINEL, "<nowiki />")
}

/// Formats an unexpanded template whose arguments may have been partially
/// or fully expanded.
fn unexpanded_template(args: &[String], nowiki: bool) -> String {
    if nowiki {
        format!("&lbrace;&lbrace;{}&rbrace;&rbrace;", args.join("&vert;"))
    } else {
        String::from("{{") + &args.join("|") + "}}"
    }
}

/// Formats an unexpanded template argument reference.
fn unexpanded_arg(args: &[String], nowiki: bool) -> String {
    if nowiki {
        format!(
            "&lbrace;&lbrace;&lbrace;{}&rbrace;&rbrace;&rbrace;",
            args.join("&vert;")
        )
    } else {
        String::from("{{{") + &args.join("|") + "}}}"
    }
}

/// Formats an unexpanded internal link.
fn unexpanded_link(args: &[String], nowiki: bool) -> String {
    if nowiki {
        format!("&lsqb;&lsqb;{}&rsqb;&rsqb;", args.join("&vert;"))
    } else {
        String::from("[[") + &args.join("|") + "]]"
    }
}

/// Formats an unexpanded external link.
fn unexpanded_extlink(args: &[String], nowiki: bool) -> String {
    if nowiki {
        format!("&lsqb;{}&rsqb;", args.join("&vert;"))
    } else {
        String::from("[") + &args.join("|") + "]"
    }
}

/// Iterates the cookie characters of `text` as `(byte offset, char, table
/// index)`.
///
/// Every codepoint in the cookie range shares the UTF-8 lead byte `0xF1`,
/// and `0xF1` can only ever be a lead byte, so a byte scan finds exactly the
/// cookies.
fn cookie_chars(text: &str) -> impl Iterator<Item = (usize, char, usize)> + '_ {
    memchr::memchr_iter(0xF1, text.as_bytes()).filter_map(move |start| {
        let ch = text[start..].chars().next()?;
        cookie_index(ch).map(|index| (start, ch, index))
    })
}

/// Strips an ASCII prefix case-insensitively.
fn strip_prefix_ignore_ascii_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    s.get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &s[prefix.len()..])
}
