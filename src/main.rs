//! The expand-rs command line tool: ingest a dump, expand pages.

#![warn(
    clippy::pedantic,
    clippy::missing_docs_in_private_items,
    missing_docs,
    rust_2018_idioms
)]

use expand_rs::{
    dump,
    expand::{ErrorSink, PageContext, PageSource},
    namespace::NamespaceData,
    store::PageStore,
};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::{
    fs::File,
    io::{self, Write as _},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

/// Errors that may occur when parsing arguments.
#[derive(Debug, thiserror::Error)]
enum ArgsError {
    /// Extra unknown junk on the command line.
    #[error("unknown arguments: {}", _0.display())]
    Extra(std::ffi::OsString),
    /// Missing the store directory argument.
    #[error("missing store directory argument")]
    StoreDir,
    /// Some other parsing error.
    #[error(transparent)]
    Pico(#[from] pico_args::Error),
}

/// Command-line arguments.
struct Args {
    /// The dump file to ingest, if any.
    dump_path: Option<String>,
    /// The store directory.
    store_dir: String,
    /// An alternative namespace JSON file.
    namespaces_path: Option<String>,
    /// A single title to expand and print.
    expand_title: Option<String>,
    /// Whether to expand every wikitext page.
    expand_all: bool,
    /// Worker threads for `--all`. Zero means one per core.
    threads: usize,
    /// An extra file receiving non-debug diagnostics.
    errors_path: Option<String>,
}

impl Args {
    /// Tries to create an [`Args`] from the given command line arguments and
    /// environment variables.
    fn new() -> Result<Args, ArgsError> {
        let mut args = pico_args::Arguments::from_env();

        let namespaces_path = args.opt_value_from_str("--namespaces")?;
        let expand_title = args.opt_value_from_str("--expand")?;
        let expand_all = args.contains("--all");
        let threads = args.opt_value_from_str("--threads")?.unwrap_or(0);
        let errors_path = args.opt_value_from_str("--errors")?;

        let first = args.opt_free_from_str::<String>()?;
        let second = args.opt_free_from_str::<String>()?;
        let (dump_path, store_dir) = match (first, second) {
            (Some(dump), Some(dir)) => (Some(dump), dir),
            (Some(dir), None) => (std::env::var("WIKI_DUMP_FILE").ok(), dir),
            (None, _) => (
                std::env::var("WIKI_DUMP_FILE").ok(),
                std::env::var("WIKI_STORE_DIR").map_err(|_| ArgsError::StoreDir)?,
            ),
        };

        let rest = args.finish();
        if !rest.is_empty() {
            return Err(ArgsError::Extra(rest.join(std::ffi::OsStr::new(" "))));
        }

        Ok(Self {
            dump_path,
            store_dir,
            namespaces_path,
            expand_title,
            expand_all,
            threads,
            errors_path,
        })
    }
}

/// Command line usage instructions.
fn usage() {
    let exe = std::env::args().next().unwrap_or_default();
    eprintln!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    eprintln!("Usage: {exe} [options] <dump.xml[.bz2]> <outdir>\n");
    eprintln!("or, use environment variables:");
    eprintln!("  WIKI_DUMP_FILE");
    eprintln!("  WIKI_STORE_DIR\n");
    eprintln!("Options:");
    eprintln!("  --namespaces <path>: Namespace JSON (default: bundled English table)");
    eprintln!("  --expand <title>: Expand a single stored page and print it");
    eprintln!("  --all: Expand every wikitext page, emitting JSON lines on stdout");
    eprintln!("  --threads <n>: Worker threads for --all (default: all cores)");
    eprintln!("  --errors <path>: Also write non-debug diagnostics to this file");
}

/// A page-per-second progress meter, safe to tick from many workers.
struct Progress {
    /// Total pages expected, zero when unknown.
    total: usize,
    /// Pages processed so far.
    count: AtomicUsize,
    /// When processing started.
    started: Instant,
    /// When progress was last reported.
    last: Mutex<Instant>,
}

impl Progress {
    /// Creates a meter expecting `total` pages.
    fn new(total: usize) -> Self {
        Self {
            total,
            count: AtomicUsize::new(0),
            started: Instant::now(),
            last: Mutex::new(Instant::now()),
        }
    }

    /// Counts one page, logging a rate line about once a second.
    // Clippy: Page counts within f64 range; the meter is informational.
    #[allow(clippy::cast_precision_loss)]
    fn tick(&self) {
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;

        let mut last = self.last.lock();
        if last.elapsed() < Duration::from_secs(1) {
            return;
        }
        *last = Instant::now();
        drop(last);

        let elapsed = self.started.elapsed().as_secs_f64();
        let pps = count as f64 / elapsed.max(f64::EPSILON);
        if self.total > 0 {
            let percent = 100.0 * count as f64 / self.total as f64;
            let eta = (self.total - count) as f64 / pps.max(f64::EPSILON);
            // Clippy: ETA seconds fit comfortably in u64.
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let eta = eta as u64;
            log::info!(
                "processed {count} of {} pages ({percent:.1}%) @ {pps:.0} pages/sec, eta {:02}:{:02}:{:02}",
                self.total,
                eta / 3600,
                eta / 60 % 60,
                eta % 60
            );
        } else {
            log::info!("{count} pages @ {pps:.0} pages/sec");
        }
    }
}

/// Builds a fresh page context over the shared store.
fn make_context(
    name_data: &Arc<NamespaceData>,
    store: &Arc<PageStore>,
    errors: Option<&ErrorSink>,
) -> PageContext {
    let source: Arc<dyn PageSource> = Arc::clone(store) as Arc<dyn PageSource>;
    let ctx = PageContext::new(Arc::clone(name_data), source);
    match errors {
        Some(errors) => ctx.with_error_sink(Arc::clone(errors)),
        None => ctx,
    }
}

/// Streams a dump file into the store.
fn ingest(store: &mut PageStore, path: &str) -> Result<(), Box<dyn std::error::Error>> {
    log::info!("Ingesting {path} ...");
    let progress = Progress::new(0);

    for page in dump::open(path)? {
        let page = page?;
        if let Some(target) = &page.redirect {
            store.add("redirect", &page.title, target)?;
        } else {
            store.add(&page.model, &page.title, &page.text)?;
        }
        progress.tick();
    }

    log::info!("Ingested {} pages", store.len());
    Ok(())
}

/// Expands every wikitext page and emits `{title, text}` JSON lines.
///
/// Workers each own a context; results arrive in arbitrary completion
/// order. A page that fails stays a log line, never a dead run.
fn expand_all(
    name_data: &Arc<NamespaceData>,
    store: &Arc<PageStore>,
    errors: Option<&ErrorSink>,
) -> Result<(), Box<dyn std::error::Error>> {
    let titles = store
        .pages()
        .filter(|(_, entry)| entry.model == "wikitext")
        .map(|(title, _)| title.to_string())
        .collect::<Vec<_>>();

    let progress = Progress::new(titles.len());
    let out = Mutex::new(io::BufWriter::new(io::stdout()));

    titles.par_iter().for_each_init(
        || make_context(name_data, store, errors),
        |ctx, title| {
            ctx.start_page(title);
            match store.read(title) {
                Some(text) => {
                    let expanded = ctx.expand(&text, None, None);
                    let line = serde_json::json!({ "title": title, "text": expanded });
                    let mut out = out.lock();
                    let _ = writeln!(out, "{line}");
                }
                None => log::warn!("{title}: could not read page back from the store"),
            }
            progress.tick();
        },
    );

    out.lock().flush()?;
    Ok(())
}

/// Runs the show.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let args = match Args::new() {
        Ok(args) => args,
        Err(err) => {
            usage();
            return Err(err)?;
        }
    };

    let name_data = Arc::new(match &args.namespaces_path {
        Some(path) => NamespaceData::from_path(path)?,
        None => NamespaceData::english(),
    });

    let errors: Option<ErrorSink> = match &args.errors_path {
        Some(path) => {
            let sink: Box<dyn io::Write + Send> = Box::new(File::create(path)?);
            Some(Arc::new(Mutex::new(sink)))
        }
        None => None,
    };

    let mut store = PageStore::open(&args.store_dir, Arc::clone(&name_data))?;
    if let Some(dump_path) = &args.dump_path {
        ingest(&mut store, dump_path)?;
        store.resolve_template_redirects();
        store.save()?;
        log::info!("Store saved to {}", args.store_dir);
    }
    let store = Arc::new(store);

    if args.threads > 0 {
        // Only possible before the global pool's first use; an Err just
        // means somebody built it already.
        let _ = rayon::ThreadPoolBuilder::new()
            .num_threads(args.threads)
            .build_global();
    }

    if let Some(title) = &args.expand_title {
        let mut ctx = make_context(&name_data, &store, errors.as_ref());
        ctx.start_page(title);
        let Some(text) = store.read(title) else {
            return Err(format!("no such page: {title}").into());
        };
        println!("{}", ctx.expand(&text, None, None));
    }

    if args.expand_all {
        expand_all(&name_data, &store, errors.as_ref())?;
    }

    Ok(())
}

/// Uses the [`Display`](core::fmt::Display) formatter for an error even when
/// the [`Debug`](core::fmt::Debug) formatter is requested.
struct DisplayError(Box<dyn std::error::Error>);

impl core::fmt::Debug for DisplayError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl<E: Into<Box<dyn std::error::Error>>> From<E> for DisplayError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

fn main() -> Result<(), DisplayError> {
    run().map_err(Into::into)
}
