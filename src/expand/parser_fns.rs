//! Parser function implementations.
//!
//! Parser functions share invocation syntax with transclusions
//! (`{{name:arg|…}}`), so the expander consults [`is_parser_fn`] before
//! treating a name as a template. Handlers receive their operands
//! *unexpanded* and evaluate them on demand through [`FnArgs::eval`]; this
//! is what lets `#if` and `#switch` skip dead branches and their side
//! effects entirely.

// Clippy: Function signatures all conform to a specific API; inline modules
// are clearer with wildcard import.
#![allow(clippy::unnecessary_wraps, clippy::wildcard_imports)]

use super::{Frame, InvokeCall, PageContext, Result, expander};
use core::fmt::Write as _;
use std::time::Duration;

/// The function signature of a parser function.
type ParserFn = fn(&mut String, &mut PageContext, &FnArgs<'_>) -> Result;

/// The call environment handed to every parser function.
pub(crate) struct FnArgs<'a> {
    /// The canonical name the function was called by.
    pub(crate) callee: &'a str,
    /// Unexpanded operands. For `{{name:first|second}}`, the text after the
    /// colon is operand zero.
    pub(crate) args: &'a [String],
    /// The frame of the calling template, if any.
    pub(crate) parent: Option<&'a Frame>,
    /// The `#invoke` time budget.
    pub(crate) timeout: Option<Duration>,
}

impl FnArgs<'_> {
    /// Lazily expands the operand at `index`.
    fn eval(&self, ctx: &mut PageContext, index: usize) -> Option<String> {
        self.args
            .get(index)
            .map(|arg| expander::expand_recur(ctx, arg, self.parent, self.timeout))
    }

    /// Lazily expands and trims the operand at `index`.
    ///
    /// MediaWiki implicitly trimmed the arguments of every conventionally
    /// registered parser function, so most handlers want this form.
    fn eval_trim(&self, ctx: &mut PageContext, index: usize) -> Option<String> {
        self.eval(ctx, index).map(|value| value.trim().to_string())
    }

    /// The number of operands.
    fn len(&self) -> usize {
        self.args.len()
    }
}

mod cond {
    //! Flow control parser functions.

    use super::*;
    use crate::common::{fuzzy_eq, strval};

    /// `{{#expr: expression}}`
    pub fn expr(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        if let Some(expr) = arguments.eval_trim(ctx, 0) {
            match crate::expr::do_expression(&expr) {
                Ok(Some(result)) => out.push_str(&strval(result)),
                Ok(None) => {}
                Err(err) => write!(
                    out,
                    r#"<span class="error">{}</span>"#,
                    html_escape::encode_text(&err.to_string())
                )?,
            }
        }

        Ok(())
    }

    /// `{{#if: condition | consequent (!condition.trim().is_empty()) | alternate }}`
    pub fn r#if(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        let condition_empty = arguments
            .eval_trim(ctx, 0)
            .is_none_or(|value| value.is_empty());
        let index = 1 + usize::from(condition_empty);
        if let Some(value) = arguments.eval_trim(ctx, index) {
            out.push_str(&value);
        }

        Ok(())
    }

    /// `{{#ifeq: lhs | rhs | consequent (lhs == rhs) | alternate }}`
    pub fn if_eq(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        let lhs = arguments.eval_trim(ctx, 0).unwrap_or_default();
        let rhs = arguments.eval_trim(ctx, 1).unwrap_or_default();
        let index = 2 + usize::from(!fuzzy_eq(&lhs, &rhs));
        if let Some(value) = arguments.eval_trim(ctx, index) {
            out.push_str(&value);
        }

        Ok(())
    }

    /// `{{#ifexpr: expression | consequent (expression != 0.0) | alternate }}`
    pub fn if_expr(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        let expr = arguments.eval_trim(ctx, 0).unwrap_or_default();
        match crate::expr::do_expression(&expr) {
            Ok(result) => {
                let index = 1 + usize::from(result.unwrap_or(0.0) == 0.0);
                if let Some(value) = arguments.eval_trim(ctx, index) {
                    out.push_str(&value);
                }
            }
            Err(err) => write!(
                out,
                r#"<span class="error">{}</span>"#,
                html_escape::encode_text(&err.to_string())
            )?,
        }

        Ok(())
    }

    /// `{{#switch: match | case [| case ...] = value | default }}`
    pub fn switch(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        let lhs = arguments.eval_trim(ctx, 0).unwrap_or_default();
        let len = arguments.len();
        let mut found = false;
        let mut consequent = None;

        for index in 1..len {
            let case = arguments.eval(ctx, index).unwrap_or_default();

            // A `k=v` case carries its own value; bare cases fall through to
            // the next `k=v`. A bare final case is the default.
            let (rhs, value, is_kv) = match case.split_once('=') {
                Some((k, v)) => (k.trim().to_string(), v.trim().to_string(), true),
                None => (case.trim().to_string(), String::new(), false),
            };

            if is_kv && rhs == "#default" {
                consequent = Some(value.clone());
            }

            if !found {
                found = fuzzy_eq(&lhs, &rhs);
            }

            if found && is_kv {
                consequent = Some(value);
                break;
            }

            if index + 1 == len && consequent.is_none() && !is_kv {
                consequent = Some(rhs);
                break;
            }
        }

        if let Some(value) = consequent {
            out.push_str(&value);
        }

        Ok(())
    }
}

mod ext {
    //! Extension-shaped parser functions.

    use super::*;

    /// `{{#tag: tag_name | content [| attribute [= value] ...] }}`
    pub fn extension_tag(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        let Some(name) = arguments.eval_trim(ctx, 0) else {
            return Ok(());
        };
        let name = name.to_ascii_lowercase();
        if name.is_empty() {
            return Ok(());
        }

        let content = arguments.eval(ctx, 1);

        let mut attributes = String::new();
        for index in 2..arguments.len() {
            if let Some(attribute) = arguments.eval_trim(ctx, index)
                && !attribute.is_empty()
            {
                match attribute.split_once('=') {
                    Some((key, value)) => write!(
                        attributes,
                        r#" {}="{}""#,
                        key.trim(),
                        html_escape::encode_double_quoted_attribute(value.trim())
                    )?,
                    None => write!(attributes, " {attribute}")?,
                }
            }
        }

        match content {
            Some(content) => write!(out, "<{name}{attributes}>{content}</{name}>")?,
            None => write!(out, "<{name}{attributes}/>")?,
        }

        Ok(())
    }

    /// `{{#invoke: module | function [| argument [= value] ...] }}`
    pub fn invoke(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        let Some(sandbox) = ctx.sandbox() else {
            ctx.warning(&format!(
                "cannot run #invoke:{}: no Lua sandbox installed",
                arguments.args.first().map_or("", |arg| arg.trim())
            ));
            out.push_str("<strong class='error'>Script error: no Lua sandbox</strong>");
            return Ok(());
        };

        let call = InvokeCall {
            ctx: &mut *ctx,
            args: arguments.args,
            parent: arguments.parent,
            timeout: arguments.timeout,
        };
        match sandbox.invoke(call) {
            Ok(result) => out.push_str(&result),
            Err(err) => {
                let err = err.to_string();
                ctx.error_with_trace("#invoke failed", &err);
                write!(
                    out,
                    "<strong class='error'>Script error: {}</strong>",
                    html_escape::encode_safe(&err)
                )?;
            }
        }

        Ok(())
    }
}

mod page {
    //! Page and namespace information functions.

    use super::*;

    /// `{{PAGENAME[:title]}}`, `{{FULLPAGENAME[:title]}}`, or
    /// `{{SUBPAGENAME[:title]}}`, distinguished by callee.
    pub fn page_name(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        let title = arguments
            .eval_trim(ctx, 0)
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| ctx.title.clone());

        if arguments.callee == "fullpagename" {
            out.push_str(&title);
            return Ok(());
        }

        let name_data = ctx.name_data();
        let text = match title.split_once(':') {
            Some((head, tail)) if name_data.get(head).is_some() => tail,
            _ => &title,
        };

        if arguments.callee == "subpagename" {
            out.push_str(text.rsplit('/').next().unwrap_or(text));
        } else {
            out.push_str(text);
        }

        Ok(())
    }

    /// `{{NAMESPACE[:title]}}`
    pub fn namespace(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        let title = arguments
            .eval_trim(ctx, 0)
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| ctx.title.clone());

        let name_data = ctx.name_data();
        if let Some(ns) = title.split_once(':').and_then(|(head, _)| name_data.get(head)) {
            // The main namespace has an empty name, which falls out here
            // for any title without a recognized prefix.
            out.push_str(&ns.name);
        }

        Ok(())
    }

    /// `{{ns: namespace name or id }}`
    pub fn namespace_by_name_or_id(
        out: &mut String,
        ctx: &mut PageContext,
        arguments: &FnArgs<'_>,
    ) -> Result {
        if let Some(value) = arguments.eval_trim(ctx, 0) {
            let name_data = ctx.name_data();
            let ns = value
                .parse::<i32>()
                .ok()
                .map_or_else(|| name_data.get(&value), |id| name_data.by_id(id));
            if let Some(ns) = ns {
                out.push_str(&ns.name);
            }
        }

        Ok(())
    }
}

mod string {
    //! String manipulation functions.

    use super::*;
    use crate::common::collapse_whitespace;

    /// `{{anchorencode: text }}`
    pub fn anchor_encode(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        if let Some(value) = arguments.eval_trim(ctx, 0) {
            let value = collapse_whitespace(&value).replace(' ', "_");
            out.push_str(&crate::common::url_encode(&value));
        }
        Ok(())
    }

    /// `{{#explode: text | delimiter | position [| limit] }}`
    pub fn explode(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        let text = arguments.eval_trim(ctx, 0).unwrap_or_default();
        let delimiter = arguments
            .eval_trim(ctx, 1)
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| " ".to_string());
        let position = arguments
            .eval_trim(ctx, 2)
            .and_then(|p| p.parse::<i64>().ok())
            .unwrap_or(0);
        let limit = arguments.eval_trim(ctx, 3).and_then(|l| l.parse::<usize>().ok());

        let pieces = match limit {
            Some(limit) => text.splitn(limit, &delimiter).collect::<Vec<_>>(),
            None => text.split(&delimiter).collect::<Vec<_>>(),
        };

        // Clippy: Piece counts are bounded by the text length.
        #[allow(clippy::cast_possible_wrap)]
        let index = if position < 0 {
            pieces.len() as i64 + position
        } else {
            position
        };
        if let Ok(index) = usize::try_from(index)
            && let Some(piece) = pieces.get(index)
        {
            out.push_str(piece);
        }

        Ok(())
    }

    /// `{{formatnum: number [| R] }}`
    pub fn format_number(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        if let Some(value) = arguments.eval_trim(ctx, 0)
            && !value.is_empty()
        {
            let raw = arguments.eval_trim(ctx, 1).as_deref() == Some("R");
            if raw {
                out.push_str(&value.replace(',', ""));
            } else if let Ok(n) = value.parse::<f64>() {
                out.push_str(&crate::common::format_number(n, false));
            } else {
                out.push_str(&value);
            }
        }

        Ok(())
    }

    /// `{{lc: string }}`
    pub fn lc(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        if let Some(value) = arguments.eval_trim(ctx, 0) {
            out.push_str(&value.to_lowercase());
        }
        Ok(())
    }

    /// `{{lcfirst: string }}`
    pub fn lc_first(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        if let Some(value) = arguments.eval_trim(ctx, 0) {
            let mut text = value.chars();
            if let Some(first) = text.next() {
                write!(out, "{}{}", first.to_lowercase(), text.as_str())?;
            }
        }
        Ok(())
    }

    /// `{{#len: string }}`
    pub fn len(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        let value = arguments.eval_trim(ctx, 0).unwrap_or_default();
        write!(out, "{}", value.chars().count())?;
        Ok(())
    }

    /// `{{padleft: string | length [| padding] }}`
    pub fn pad_left(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        if let (Some(value), Some(length)) =
            (arguments.eval_trim(ctx, 0), arguments.eval_trim(ctx, 1))
        {
            let length = length.parse::<usize>().unwrap_or(0);
            push_padding(out, ctx, arguments, length, &value)?;
            out.push_str(&value);
        }
        Ok(())
    }

    /// `{{padright: string | length [| padding] }}`
    pub fn pad_right(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        if let (Some(value), Some(length)) =
            (arguments.eval_trim(ctx, 0), arguments.eval_trim(ctx, 1))
        {
            let length = length.parse::<usize>().unwrap_or(0);
            out.push_str(&value);
            push_padding(out, ctx, arguments, length, &value)?;
        }
        Ok(())
    }

    /// Writes the padding characters shared by `padleft` and `padright`.
    fn push_padding(
        out: &mut String,
        ctx: &mut PageContext,
        arguments: &FnArgs<'_>,
        length: usize,
        value: &str,
    ) -> Result {
        let count = value.chars().count();
        if count < length {
            let padding = arguments
                .eval_trim(ctx, 2)
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "0".to_string());
            out.extend(padding.chars().cycle().take(length - count));
        }
        Ok(())
    }

    /// `{{plural: number | singular | plural }}`
    pub fn plural(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        if let Some(value) = arguments.eval_trim(ctx, 0) {
            let n = value
                .trim_end_matches(|c: char| !c.is_ascii_digit())
                .parse::<i32>()
                .unwrap_or(0)
                .abs();
            let index = usize::from(n != 1);
            if let Some(value) = arguments.eval_trim(ctx, 1 + index) {
                out.push_str(&value);
            }
        }

        Ok(())
    }

    /// `{{#pos: text | search [| offset] }}`
    pub fn pos(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        let text = arguments.eval_trim(ctx, 0).unwrap_or_default();
        let search = arguments.eval_trim(ctx, 1).unwrap_or_default();
        let offset = arguments
            .eval_trim(ctx, 2)
            .and_then(|o| o.parse::<usize>().ok())
            .unwrap_or(0);

        let start = text
            .char_indices()
            .nth(offset)
            .map_or(text.len(), |(byte, _)| byte);
        if let Some(found) = text[start..].find(&search) {
            write!(out, "{}", text[..start + found].chars().count())?;
        }

        Ok(())
    }

    /// `{{#replace: text | search | replacement }}`
    pub fn replace(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        let text = arguments.eval_trim(ctx, 0).unwrap_or_default();
        let search = arguments
            .eval_trim(ctx, 1)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| " ".to_string());
        let replacement = arguments.eval_trim(ctx, 2).unwrap_or_default();
        out.push_str(&text.replace(&search, &replacement));
        Ok(())
    }

    /// `{{#sub: text | start [| length] }}`
    ///
    /// PHP `substr` semantics over characters: negative `start` counts from
    /// the end, negative `length` stops that many characters before the end.
    pub fn sub(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        let text = arguments.eval_trim(ctx, 0).unwrap_or_default();
        let chars = text.chars().collect::<Vec<_>>();
        // Clippy: Character counts are bounded by the text length.
        #[allow(clippy::cast_possible_wrap)]
        let total = chars.len() as i64;

        let start = arguments
            .eval_trim(ctx, 1)
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        let start = if start < 0 {
            (total + start).max(0)
        } else {
            start.min(total)
        };

        let end = match arguments.eval_trim(ctx, 2).and_then(|l| l.parse::<i64>().ok()) {
            None => total,
            Some(length) if length < 0 => (total + length).max(start),
            Some(length) => (start + length).min(total),
        };

        // Clippy: Both bounds were clamped to [0, total] above.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        out.extend(&chars[start as usize..end as usize]);
        Ok(())
    }

    /// `{{#titleparts: title [| count [| first]] }}`
    pub fn title_parts(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        let title = arguments.eval_trim(ctx, 0).unwrap_or_default();
        let parts = title.split('/').collect::<Vec<_>>();
        // Clippy: Segment counts are bounded by the title length.
        #[allow(clippy::cast_possible_wrap)]
        let total = parts.len() as i64;

        let count = arguments
            .eval_trim(ctx, 1)
            .and_then(|c| c.parse::<i64>().ok())
            .unwrap_or(0);
        let first = arguments
            .eval_trim(ctx, 2)
            .and_then(|f| f.parse::<i64>().ok())
            .unwrap_or(1);

        // Segments are numbered from one; negative positions count from the
        // end, a non-positive count drops that many trailing segments.
        let start = if first < 0 {
            (total + first + 1).max(1)
        } else {
            first.max(1)
        };
        let end = if count <= 0 {
            (total + count).max(start - 1)
        } else {
            (start - 1 + count).min(total)
        };

        let lo = (start - 1).clamp(0, total);
        let hi = end.clamp(lo, total);
        // Clippy: Both bounds were clamped to [0, total] above.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let selected = &parts[lo as usize..hi as usize];
        out.push_str(&selected.join("/"));
        Ok(())
    }

    /// `{{uc: string }}`
    pub fn uc(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        if let Some(value) = arguments.eval_trim(ctx, 0) {
            out.push_str(&value.to_uppercase());
        }
        Ok(())
    }

    /// `{{ucfirst: string }}`
    pub fn uc_first(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        if let Some(value) = arguments.eval_trim(ctx, 0) {
            let mut text = value.chars();
            if let Some(first) = text.next() {
                write!(out, "{}{}", first.to_uppercase(), text.as_str())?;
            }
        }
        Ok(())
    }

    /// `{{urlencode: string }}`
    pub fn url_encode(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        if let Some(value) = arguments.eval_trim(ctx, 0) {
            // Query-string form: spaces become plus signs.
            out.push_str(&crate::common::url_encode(&value).replace("%20", "+"));
        }
        Ok(())
    }
}

mod time_fns {
    //! Date and time functions.

    use super::*;
    use crate::expand::Error;
    use time::{Date, OffsetDateTime, PrimitiveDateTime};

    /// `{{#time: format [| time] }}`
    pub fn time(out: &mut String, ctx: &mut PageContext, arguments: &FnArgs<'_>) -> Result {
        if let Some(format) = arguments.eval_trim(ctx, 0) {
            let date = arguments.eval_trim(ctx, 1).filter(|date| !date.is_empty());
            match date.as_deref().map_or(Ok(ctx.base_time), parse_date) {
                Ok(when) => out.push_str(&format_time(&format, when)?),
                Err(err) => write!(
                    out,
                    r#"<strong class="error">{}</strong>"#,
                    html_escape::encode_text(&err.to_string())
                )?,
            }
        }

        Ok(())
    }

    /// Parses the date forms `#time` accepts: `@unixtime`, an ISO date, or
    /// an ISO date and time.
    fn parse_date(s: &str) -> Result<OffsetDateTime, Error> {
        if let Some(ts) = s.strip_prefix('@') {
            let ts = ts
                .trim()
                .parse::<i64>()
                .map_err(|_| Error::Script(format!("invalid timestamp {s:?}")))?;
            return OffsetDateTime::from_unix_timestamp(ts).map_err(|err| time::Error::from(err).into());
        }

        let date_time = time::macros::format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        );
        if let Ok(parsed) = PrimitiveDateTime::parse(s, date_time) {
            return Ok(parsed.assume_utc());
        }

        let date = time::macros::format_description!("[year]-[month]-[day]");
        if let Ok(parsed) = Date::parse(s, date) {
            return Ok(parsed.midnight().assume_utc());
        }

        Err(Error::Script(format!("unsupported date {s:?}")))
    }

    /// Renders `when` through a MediaWiki time format string.
    ///
    /// Unrecognized characters pass through, a backslash escapes the next
    /// character, and quoted runs are literal.
    fn format_time(format: &str, when: OffsetDateTime) -> Result<String> {
        let mut out = String::with_capacity(format.len());
        let mut chars = format.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                }
                '"' => {
                    for next in chars.by_ref() {
                        if next == '"' {
                            break;
                        }
                        out.push(next);
                    }
                }
                'Y' => write!(out, "{:04}", when.year())?,
                'y' => write!(out, "{:02}", when.year().rem_euclid(100))?,
                'n' => write!(out, "{}", u8::from(when.month()))?,
                'm' => write!(out, "{:02}", u8::from(when.month()))?,
                'M' => write!(out, "{:.3}", when.month())?,
                'F' => write!(out, "{}", when.month())?,
                'j' => write!(out, "{}", when.day())?,
                'd' => write!(out, "{:02}", when.day())?,
                'D' => write!(out, "{:.3}", when.weekday())?,
                'l' => write!(out, "{}", when.weekday())?,
                'N' => write!(out, "{}", when.weekday().number_from_monday())?,
                'G' => write!(out, "{}", when.hour())?,
                'H' => write!(out, "{:02}", when.hour())?,
                'i' => write!(out, "{:02}", when.minute())?,
                's' => write!(out, "{:02}", when.second())?,
                'U' => write!(out, "{}", when.unix_timestamp())?,
                other => out.push(other),
            }
        }

        Ok(out)
    }
}

/// Known parser functions.
static PARSER_FUNCTIONS: phf::Map<&'static str, ParserFn> = phf::phf_map! {
    "!" => |out: &mut String, _, _| { out.push('|'); Ok(()) },
    "=" => |out: &mut String, _, _| { out.push('='); Ok(()) },

    "#expr" => cond::expr,
    "expr" => cond::expr,
    "#if" => cond::r#if,
    "#ifeq" => cond::if_eq,
    "#ifexpr" => cond::if_expr,
    "#switch" => cond::switch,

    "#tag" => ext::extension_tag,
    "tag" => ext::extension_tag,
    "#invoke" => ext::invoke,

    "fullpagename" => page::page_name,
    "pagename" => page::page_name,
    "subpagename" => page::page_name,
    "namespace" => page::namespace,
    "ns" => page::namespace_by_name_or_id,

    "anchorencode" => string::anchor_encode,
    "explode" => string::explode,
    "#explode" => string::explode,
    "formatnum" => string::format_number,
    "lc" => string::lc,
    "lcfirst" => string::lc_first,
    "len" => string::len,
    "#len" => string::len,
    "padleft" => string::pad_left,
    "padright" => string::pad_right,
    "plural" => string::plural,
    "#plural" => string::plural,
    "pos" => string::pos,
    "#pos" => string::pos,
    "replace" => string::replace,
    "#replace" => string::replace,
    "sub" => string::sub,
    "#sub" => string::sub,
    "titleparts" => string::title_parts,
    "#titleparts" => string::title_parts,
    "uc" => string::uc,
    "ucfirst" => string::uc_first,
    "urlencode" => string::url_encode,

    "#time" => time_fns::time,
};

/// Returns true if `name` is a registered parser function.
pub(crate) fn is_parser_fn(name: &str) -> bool {
    PARSER_FUNCTIONS.contains_key(name)
}

/// Calls a parser function by canonical name.
///
/// Handler failures become in-band error markers; unknown names (which can
/// reach here through the `#`-prefix rule) expand to nothing.
pub(crate) fn call_parser_function(
    ctx: &mut PageContext,
    fn_name: &str,
    args: &[String],
    parent: Option<&Frame>,
    timeout: Option<Duration>,
) -> String {
    let Some(parser_fn) = PARSER_FUNCTIONS.get(fn_name) else {
        ctx.debug(&format!("unimplemented parser function {fn_name:?}"));
        return String::new();
    };

    let arguments = FnArgs {
        callee: fn_name,
        args,
        parent,
        timeout,
    };
    let mut out = String::new();
    if let Err(err) = parser_fn(&mut out, ctx, &arguments) {
        ctx.error(&format!("parser function {fn_name} failed: {err}"));
        return format!(
            "<strong class='error'>{}</strong>",
            html_escape::encode_safe(&err.to_string())
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expand::tests::page_context;

    fn expand_one(text: &str) -> String {
        let mut ctx = page_context(&[]);
        crate::expand::expand(&mut ctx, text, None, None)
    }

    #[test]
    fn test_if() {
        assert_eq!(expand_one("{{#if: x | yes | no}}"), "yes");
        assert_eq!(expand_one("{{#if: | yes | no}}"), "no");
        assert_eq!(expand_one("{{#if: \t | yes | no}}"), "no", "whitespace is empty");
        assert_eq!(expand_one("{{#if: x | yes}}"), "yes");
        assert_eq!(expand_one("{{#if: | yes}}"), "");
    }

    #[test]
    fn test_if_lazy_branches() {
        // The dead branch holds an undefined template; laziness means no
        // error marker appears.
        assert_eq!(expand_one("{{#if: x | ok | {{UNDEF}}}}"), "ok");
    }

    #[test]
    fn test_ifeq() {
        assert_eq!(expand_one("{{#ifeq: a | a | same | diff}}"), "same");
        assert_eq!(expand_one("{{#ifeq: a | b | same | diff}}"), "diff");
        assert_eq!(
            expand_one("{{#ifeq: 01 | 1 | same | diff}}"),
            "same",
            "numeric forms compare numerically"
        );
    }

    #[test]
    fn test_switch() {
        assert_eq!(expand_one("{{#switch: b | a=A | b=B | C}}"), "B");
        assert_eq!(expand_one("{{#switch: z | a=A | b=B | C}}"), "C");
        assert_eq!(
            expand_one("{{#switch: a | a | b=B | C}}"),
            "B",
            "bare cases fall through to the next valued case"
        );
        assert_eq!(expand_one("{{#switch: z | #default=D | a=A}}"), "D");
        assert_eq!(expand_one("{{#switch: z | a=A}}"), "");
    }

    #[test]
    fn test_expr() {
        assert_eq!(expand_one("{{#expr: 1 + 2 * 3}}"), "7");
        assert_eq!(expand_one("{{#expr: 10 / 4}}"), "2.5");
        assert_eq!(expand_one("{{#ifexpr: 2 > 1 | big | small}}"), "big");
        assert_eq!(expand_one("{{#ifexpr: 0 | big | small}}"), "small");
    }

    #[test]
    fn test_case_functions() {
        assert_eq!(expand_one("{{lc: ABC}}"), "abc");
        assert_eq!(expand_one("{{uc: abc}}"), "ABC");
        assert_eq!(expand_one("{{ucfirst: abc}}"), "Abc");
        assert_eq!(expand_one("{{lcfirst: ABC}}"), "aBC");
        assert_eq!(expand_one("{{LC: ABC}}"), "abc", "names are case-insensitive");
    }

    #[test]
    fn test_padding() {
        assert_eq!(expand_one("{{padleft: 7 | 3}}"), "007");
        assert_eq!(expand_one("{{padright: 7 | 3 | xy}}"), "7xy");
        assert_eq!(expand_one("{{padleft: long | 2}}"), "long");
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(expand_one("{{#len: four}}"), "4");
        assert_eq!(expand_one("{{#pos: haystack | stack}}"), "3");
        assert_eq!(expand_one("{{#pos: haystack | missing}}"), "");
        assert_eq!(expand_one("{{#sub: Icecream | 3}}"), "cream");
        assert_eq!(expand_one("{{#sub: Icecream | 0 | 3}}"), "Ice");
        assert_eq!(expand_one("{{#sub: Icecream | -5 | 2}}"), "cr");
        assert_eq!(expand_one("{{#replace: a b c | b | x}}"), "a x c");
        assert_eq!(expand_one("{{#explode: a/b/c | / | 1}}"), "b");
        assert_eq!(expand_one("{{#explode: a/b/c | / | -1}}"), "c");
    }

    #[test]
    fn test_titleparts() {
        assert_eq!(expand_one("{{#titleparts: a/b/c | 1 | 2}}"), "b");
        assert_eq!(expand_one("{{#titleparts: a/b/c | -1}}"), "a/b");
        assert_eq!(expand_one("{{#titleparts: a/b/c | 0 | -1}}"), "c");
        assert_eq!(expand_one("{{#titleparts: a/b/c}}"), "a/b/c");
    }

    #[test]
    fn test_encoding_functions() {
        assert_eq!(expand_one("{{urlencode: a b+c}}"), "a+b%2Bc");
        assert_eq!(expand_one("{{anchorencode: a  b}}"), "a_b");
    }

    #[test]
    fn test_formatnum_and_plural() {
        assert_eq!(expand_one("{{formatnum: 1234567}}"), "1,234,567");
        assert_eq!(expand_one("{{formatnum: 1,234 | R}}"), "1234");
        assert_eq!(expand_one("{{plural: 1 | page | pages}}"), "page");
        assert_eq!(expand_one("{{plural: 2 | page | pages}}"), "pages");
    }

    #[test]
    fn test_page_functions() {
        // The test context starts pages as "Test page", main namespace.
        assert_eq!(expand_one("{{PAGENAME}}"), "Test page");
        assert_eq!(expand_one("{{FULLPAGENAME}}"), "Test page");
        assert_eq!(expand_one("{{NAMESPACE}}"), "");
        assert_eq!(expand_one("{{NAMESPACE:Template:X}}"), "Template");
        assert_eq!(expand_one("{{PAGENAME:Template:X/sub}}"), "X/sub");
        assert_eq!(expand_one("{{SUBPAGENAME:Template:X/sub}}"), "sub");
        assert_eq!(expand_one("{{ns:10}}"), "Template");
        assert_eq!(expand_one("{{ns:Image}}"), "File");
    }

    #[test]
    fn test_tag() {
        assert_eq!(
            expand_one("{{#tag: span | text | class=note}}"),
            r#"<span class="note">text</span>"#
        );
        assert_eq!(expand_one("{{#tag: br}}"), "<br/>");
    }

    #[test]
    fn test_time() {
        assert_eq!(expand_one("{{#time: Y-m-d | @0}}"), "1970-01-01");
        assert_eq!(expand_one("{{#time: j F Y | 2001-02-03}}"), "3 February 2001");
        assert_eq!(expand_one("{{#time: H:i:s | 2001-02-03 04:05:06}}"), "04:05:06");
        assert_eq!(expand_one(r#"{{#time: \Y | @0}}"#), "Y", "backslash escapes");
    }

    #[test]
    fn test_escape_words() {
        assert_eq!(expand_one("{{!}}"), "|");
        assert_eq!(expand_one("{{=}}"), "=");
    }

    #[test]
    fn test_unknown_hash_function() {
        assert_eq!(
            expand_one("{{#nosuchthing: x}}"),
            "",
            "unknown #-functions expand to nothing"
        );
    }
}
