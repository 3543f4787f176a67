//! Template expansion types and functions.
//!
//! Wikitext cannot be parsed by a conventional grammar: template expressions
//! nest arbitrarily, overlap lexically (`{{{{x}}}}` is ambiguous between
//! argument-then-template and template-then-argument), and the text a
//! construct expands to is only knowable after expansion. Expansion is
//! therefore staged over a flat string:
//!
//! 1. The encoder repeatedly replaces the *innermost* template argument,
//!    template invocation, internal link, or external link with a single
//!    placeholder codepoint (a "cookie") until nothing changes.
//! 2. The expander walks cookies outside-in, substituting arguments against
//!    the active frame and dispatching templates to the page store, parser
//!    functions to the registry, and `#invoke` to the Lua sandbox seam.
//! 3. The finalizer re-serialises any surviving cookie back into literal
//!    wikitext and resolves the `<nowiki />` sentinel.
//!
//! Each page is expanded inside a [`PageContext`], which owns the per-page
//! cookie table and the diagnostic expand stack. Contexts are single-writer;
//! parallelism happens at page granularity with one context per worker.

use crate::{namespace::NamespaceData, store};
use core::fmt;
use parking_lot::Mutex;
use std::{io::Write as _, sync::Arc, time::Duration};
use time::OffsetDateTime;

pub(crate) mod body;
mod cookies;
mod encoder;
mod expander;
pub(crate) mod parser_fns;

use cookies::CookieTable;
pub use expander::expand;

/// The first codepoint of the cookie range.
///
/// Cookies live in the unassigned Unicode planes 4 through 7, which contain
/// no character that can legally appear in wiki source. Every codepoint in
/// the range shares the UTF-8 lead byte `0xF1`, so cookie scans reduce to a
/// byte search. Exposed so the downstream parser can strip stray cookies.
pub const COOKIE_BASE: char = '\u{40000}';

/// The size of the cookie range.
pub const MAX_COOKIES: usize = 0x0004_0000;

/// The inline `<nowiki />` sentinel.
///
/// A single codepoint outside the cookie range whose only role is to defeat
/// adjacent bracket matching; the finalizer turns it back into `<nowiki />`.
pub const NOWIKI_SENTINEL: char = '\u{80000}';

/// The classification of an encoded construct.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CookieKind {
    /// A template invocation or parser function call, `{{…}}`.
    Template,
    /// A template argument reference, `{{{…}}}`.
    ArgRef,
    /// An internal link, `[[…]]`.
    Link,
    /// An external link or bracketed span, `[…]`.
    ExtLink,
    /// Escaped `<nowiki>…</nowiki>` content.
    Nowiki,
}

/// An encoded construct, stored in the per-page cookie table.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Cookie {
    /// What kind of construct this cookie stands for.
    pub kind: CookieKind,
    /// The pipe-separated pieces as they appeared, possibly containing inner
    /// cookies.
    pub args: Vec<String>,
    /// True when the original delimiters contained the nowiki sentinel,
    /// meaning the construct must be left unexpanded in the final output.
    pub nowiki: bool,
}

/// A template argument key. Positional arguments use integer keys, named
/// arguments use whitespace-collapsed string keys.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum ArgKey {
    /// A positional argument number, 1-based.
    Num(u32),
    /// A named argument.
    Name(String),
}

impl fmt::Display for ArgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{n}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// The expanded arguments of one template activation.
pub type ArgMap = std::collections::HashMap<ArgKey, String>;

/// The argument environment of a single template activation.
///
/// The frame of the caller is threaded through every recursive expansion as
/// an explicit `Option<&Frame>` argument, never through shared state, so
/// parallel workers and nested invocations compose.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    /// The canonicalized title of the activated template.
    pub title: String,
    /// The already-expanded arguments of the activation.
    pub args: ArgMap,
}

/// Read access to the page store, as consumed by the expander.
///
/// Titles passed to [`template`](Self::template) are already canonical; the
/// other methods receive titles as written.
pub trait PageSource: Send + Sync {
    /// Returns true if the given page exists.
    fn exists(&self, title: &str) -> bool;
    /// Reads raw page contents. Returns `None` if the page does not exist.
    fn read(&self, title: &str) -> Option<String>;
    /// Returns the normalized body of a template by canonical name.
    fn template(&self, name: &str) -> Option<String>;
    /// Returns the redirect target of a page, if it is a redirect.
    fn redirect(&self, title: &str) -> Option<String>;
}

/// A single `#invoke` dispatch into the sandbox.
pub struct InvokeCall<'c, 'a> {
    /// The active page context.
    pub ctx: &'c mut PageContext,
    /// The arguments of the `#invoke`, starting with the module name. These
    /// are unexpanded; use [`expand`](Self::expand) to evaluate them.
    pub args: &'a [String],
    /// The frame of the calling template, if any. Lua code may reach it.
    pub parent: Option<&'a Frame>,
    /// How long the sandboxed call may run.
    pub timeout: Option<Duration>,
}

impl InvokeCall<'_, '_> {
    /// Expands encoded text in the caller's frame.
    pub fn expand(&mut self, text: &str) -> String {
        expander::expand_recur(self.ctx, text, self.parent, self.timeout)
    }
}

/// The Lua execution seam.
///
/// `{{#invoke:…}}` is dispatched through this trait. Implementations must
/// honor [`InvokeCall::timeout`] by returning a truncated result and logging
/// a warning rather than blocking indefinitely; this is the only operation
/// in the expander that may block at all.
pub trait LuaSandbox: Send + Sync {
    /// Runs one `#invoke` call and returns its string result.
    fn invoke(&self, call: InvokeCall<'_, '_>) -> Result<String, Error>;
}

/// A predicate deciding whether a template may be substituted. Receives the
/// canonical template name.
pub type TemplateFilter = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// An expansion error.
///
/// These never cross a page boundary: parser function failures are captured
/// at the dispatch site and turned into in-band error markers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An arithmetic expression evaluation error.
    #[error("eval error: {0}")]
    Expr(#[from] crate::expr::Error),

    /// A write to a buffer failed.
    #[error("fmt error: {0}")]
    Fmt(#[from] fmt::Error),

    /// A sandboxed script failed.
    #[error("script error: {0}")]
    Script(String),

    /// A date could not be parsed or formatted.
    #[error("time error: {0}")]
    Time(#[from] time::Error),
}

/// The standard result type used by fallible expansion functions.
pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// The severity of a diagnostic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Kind {
    /// Heuristic or fallback detail. Goes only to the log sink.
    Debug,
    /// Recoverable trouble, e.g. an undefined template.
    Warning,
    /// Trouble that produced an in-band error marker.
    Error,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Debug => "DEBUG",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        })
    }
}

/// An optional secondary diagnostic stream for non-debug messages.
pub type ErrorSink = Arc<Mutex<Box<dyn std::io::Write + Send>>>;

/// Per-page expansion state.
///
/// A context is reset with [`start_page`](Self::start_page) before each page
/// and must only ever be driven by one thread at a time.
pub struct PageContext {
    /// The title of the page being expanded.
    pub title: String,
    /// The per-page cookie table.
    cookies: CookieTable,
    /// Labels of every expansion entered so far, rooted at the page title.
    /// Doubles as the recursion bound and the diagnostic breadcrumb trail.
    pub expand_stack: Vec<String>,
    /// Heading titles pushed by the downstream parser. Unused here, carried
    /// for diagnostics.
    pub parser_stack: Vec<String>,
    /// Current line number of the downstream parser.
    pub linenum: u32,
    /// Whether the downstream parser runs in pre-parse mode.
    pub pre_parse: bool,
    /// Whether the downstream parser suppresses special constructs.
    pub suppress_special: bool,
    /// Whether the downstream parser sits at the beginning of a line.
    pub beginning_of_line: bool,
    /// Whether only whitespace was seen since the beginning of the line.
    pub wsp_beginning_of_line: bool,
    /// The reference time for `#time` and friends.
    pub base_time: OffsetDateTime,
    /// The namespace table of the wiki language.
    name_data: Arc<NamespaceData>,
    /// Read access to pages and templates.
    source: Arc<dyn PageSource>,
    /// Optional predicate limiting which templates are substituted.
    template_filter: Option<TemplateFilter>,
    /// Optional Lua sandbox for `#invoke`.
    sandbox: Option<Arc<dyn LuaSandbox>>,
    /// Optional secondary stream for non-debug diagnostics.
    errors: Option<ErrorSink>,
}

impl PageContext {
    /// Creates a context over the given namespace table and page source.
    pub fn new(name_data: Arc<NamespaceData>, source: Arc<dyn PageSource>) -> Self {
        Self {
            title: String::new(),
            cookies: CookieTable::default(),
            expand_stack: vec![],
            parser_stack: vec![],
            linenum: 0,
            pre_parse: false,
            suppress_special: false,
            beginning_of_line: false,
            wsp_beginning_of_line: false,
            base_time: OffsetDateTime::now_utc(),
            name_data,
            source,
            template_filter: None,
            sandbox: None,
            errors: None,
        }
    }

    /// Installs a template filter. Templates rejected by the filter are
    /// re-emitted unexpanded, with their arguments still expanded.
    #[must_use]
    pub fn with_template_filter(mut self, filter: TemplateFilter) -> Self {
        self.template_filter = Some(filter);
        self
    }

    /// Installs a Lua sandbox for `#invoke`.
    #[must_use]
    pub fn with_sandbox(mut self, sandbox: Arc<dyn LuaSandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Installs a secondary stream receiving non-debug diagnostics.
    #[must_use]
    pub fn with_error_sink(mut self, sink: ErrorSink) -> Self {
        self.errors = Some(sink);
        self
    }

    /// Resets the context for a new page.
    pub fn start_page(&mut self, title: &str) {
        self.title = title.to_string();
        self.cookies = CookieTable::default();
        self.expand_stack = vec![title.to_string()];
        self.parser_stack = vec![];
        self.linenum = 0;
        self.pre_parse = false;
        self.suppress_special = false;
        self.beginning_of_line = false;
        self.wsp_beginning_of_line = false;
    }

    /// Saves an encoded construct and returns its cookie character.
    ///
    /// Equal `(kind, args, nowiki)` triples share one character. When the
    /// table is full, logs an error and returns `None`; the caller replaces
    /// the construct with nothing rather than aborting the page.
    pub fn save_cookie(&mut self, kind: CookieKind, args: Vec<String>, nowiki: bool) -> Option<char> {
        let index = self.cookies.intern(Cookie { kind, args, nowiki });
        if index.is_none() {
            self.error("too many templates, arguments, or parser function calls");
        }
        index.map(|index| {
            // Clippy: The table bound keeps the sum inside the plane 4..8
            // scalar range, which contains no surrogates.
            #[allow(clippy::cast_possible_truncation)]
            char::from_u32(COOKIE_BASE as u32 + index as u32).expect("cookie codepoint in range")
        })
    }

    /// Loads the cookie with the given index.
    pub fn load_cookie(&self, index: usize) -> Option<&Cookie> {
        self.cookies.get(index)
    }

    /// Returns true if the given index names a saved cookie.
    pub fn has_cookie(&self, index: usize) -> bool {
        index < self.cookies.len()
    }

    /// Returns true if the template with the given (non-canonical) title
    /// should be substituted.
    pub fn expand_template(&self, title: &str) -> bool {
        self.template_filter.as_ref().is_none_or(|filter| {
            filter(&self.name_data.canonicalize_template_name(title))
        })
    }

    /// Fetches the normalized body of the template with the given title.
    pub fn get_template(&self, title: &str) -> Option<String> {
        self.source
            .template(&self.name_data.canonicalize_template_name(title))
    }

    /// The namespace table of the wiki language.
    pub fn name_data(&self) -> Arc<NamespaceData> {
        Arc::clone(&self.name_data)
    }

    /// The Lua sandbox, if one is installed.
    pub(crate) fn sandbox(&self) -> Option<Arc<dyn LuaSandbox>> {
        self.sandbox.clone()
    }

    /// Encodes nested constructs in `text` into cookies, innermost first.
    pub fn encode(&mut self, text: &str) -> String {
        encoder::encode(self, text)
    }

    /// Fully expands `text` and returns the final wikitext.
    pub fn expand(
        &mut self,
        text: &str,
        parent: Option<&Frame>,
        timeout: Option<Duration>,
    ) -> String {
        expander::expand(self, text, parent, timeout)
    }

    /// Emits a diagnostic, annotated with the page title and the expansion
    /// and parser breadcrumbs.
    fn message(&self, kind: Kind, msg: &str, trace: Option<&str>) {
        let mut msg = format!("{}: {kind}: {msg}", self.title);
        if !self.expand_stack.is_empty() {
            msg += &format!(" at {:?}", self.expand_stack);
        }
        if !self.parser_stack.is_empty() {
            msg += &format!(" parsing {}", self.parser_stack.join("/"));
        }
        if let Some(trace) = trace {
            msg.push('\n');
            msg += trace;
        }

        match kind {
            Kind::Debug => log::debug!("{msg}"),
            Kind::Warning => log::warn!("{msg}"),
            Kind::Error => log::error!("{msg}"),
        }

        if kind != Kind::Debug
            && let Some(errors) = &self.errors
        {
            let _ = writeln!(errors.lock(), "{msg}");
        }
    }

    /// Emits a DEBUG diagnostic. Goes only to the log sink.
    pub fn debug(&self, msg: &str) {
        self.message(Kind::Debug, msg, None);
    }

    /// Emits a WARNING diagnostic.
    pub fn warning(&self, msg: &str) {
        self.message(Kind::Warning, msg, None);
    }

    /// Emits an ERROR diagnostic.
    pub fn error(&self, msg: &str) {
        self.message(Kind::Error, msg, None);
    }

    /// Emits an ERROR diagnostic with a captured backtrace or similar detail.
    pub fn error_with_trace(&self, msg: &str, trace: &str) {
        self.message(Kind::Error, msg, Some(trace));
    }
}

impl fmt::Debug for PageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageContext")
            .field("title", &self.title)
            .field("cookies", &self.cookies.len())
            .field("expand_stack", &self.expand_stack)
            .finish_non_exhaustive()
    }
}

impl PageSource for store::PageStore {
    fn exists(&self, title: &str) -> bool {
        store::PageStore::exists(self, title)
    }

    fn read(&self, title: &str) -> Option<String> {
        store::PageStore::read(self, title)
    }

    fn template(&self, name: &str) -> Option<String> {
        self.template_body(name).map(str::to_string)
    }

    fn redirect(&self, title: &str) -> Option<String> {
        self.redirect_target(title).map(str::to_string)
    }
}

/// Returns the cookie table index of `ch` if it lies in the cookie range.
pub(crate) fn cookie_index(ch: char) -> Option<usize> {
    let base = COOKIE_BASE as u32;
    let offset = (ch as u32).checked_sub(base)? as usize;
    (offset < MAX_COOKIES).then_some(offset)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// A map-backed page source for tests. Keys are canonical template
    /// names; bodies are already normalized.
    pub(crate) struct MapSource {
        /// Canonical template name to normalized body.
        pub(crate) templates: HashMap<String, String>,
    }

    impl PageSource for MapSource {
        fn exists(&self, _: &str) -> bool {
            false
        }

        fn read(&self, _: &str) -> Option<String> {
            None
        }

        fn template(&self, name: &str) -> Option<String> {
            self.templates.get(name).cloned()
        }

        fn redirect(&self, _: &str) -> Option<String> {
            None
        }
    }

    /// A page source that fails the test if any template is ever fetched.
    pub(crate) struct PanicSource;

    impl PageSource for PanicSource {
        fn exists(&self, _: &str) -> bool {
            false
        }

        fn read(&self, _: &str) -> Option<String> {
            None
        }

        fn template(&self, name: &str) -> Option<String> {
            panic!("template {name:?} should never be fetched");
        }

        fn redirect(&self, _: &str) -> Option<String> {
            None
        }
    }

    /// Builds a started context over the given `(title, raw body)` template
    /// pairs, normalizing bodies the way the store does at ingest.
    pub(crate) fn page_context(templates: &[(&str, &str)]) -> PageContext {
        let _ = env_logger::try_init();
        let name_data = Arc::new(NamespaceData::english());
        let templates = templates
            .iter()
            .map(|(name, text)| {
                (
                    name_data.canonicalize_template_name(name),
                    body::transclusion_body(text),
                )
            })
            .collect();
        let mut ctx = PageContext::new(name_data, Arc::new(MapSource { templates }));
        ctx.start_page("Test page");
        ctx
    }

    /// Builds a started context whose source refuses all template fetches.
    pub(crate) fn opaque_context() -> PageContext {
        let _ = env_logger::try_init();
        let name_data = Arc::new(NamespaceData::english());
        let mut ctx = PageContext::new(name_data, Arc::new(PanicSource));
        ctx.start_page("Test page");
        ctx
    }
}
