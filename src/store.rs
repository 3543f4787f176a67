//! The on-disk page store.
//!
//! Pages are appended to a single blob file `cache` as raw UTF-8 bytes, with
//! a JSON sidecar `cache.json` recording for every title its model, offset,
//! and length, plus the redirect map and the pre-normalized template table.
//! Template bodies are normalized once at ingest since each template is
//! typically transcluded many times.
//!
//! Writes are positional and single-threaded (ingestion); reads are
//! positional too, so concurrent expansion workers share the store without
//! sharing a file offset.

use crate::{expand::body::transclusion_body, namespace::NamespaceData};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{BufReader, BufWriter},
    os::unix::fs::FileExt,
    path::PathBuf,
    sync::Arc,
};

/// Errors that may occur using the page store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A store file could not be read or written.
    #[error("{1}: I/O error: {0}")]
    Io(std::io::Error, PathBuf),

    /// The sidecar index could not be parsed or serialized.
    #[error("index error: {0}")]
    Index(#[from] serde_json::Error),
}

/// Location and model of one stored page.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PageEntry {
    /// The content model, e.g. `wikitext`, `Scribunto`, or `redirect`.
    pub model: String,
    /// Byte offset of the page content in the blob file.
    pub offset: u64,
    /// Byte length of the page content.
    pub len: u64,
}

/// The owned form of the sidecar index, as read from disk.
#[derive(Default, Deserialize)]
struct IndexIn {
    /// Title to page entry.
    pages: HashMap<String, PageEntry>,
    /// Redirect source title to target title.
    redirects: HashMap<String, String>,
    /// Canonical template name to normalized body.
    templates: HashMap<String, String>,
}

/// The borrowed form of the sidecar index, as written to disk.
#[derive(Serialize)]
struct IndexOut<'a> {
    /// Title to page entry.
    pages: &'a HashMap<String, PageEntry>,
    /// Redirect source title to target title.
    redirects: &'a HashMap<String, String>,
    /// Canonical template name to normalized body.
    templates: &'a HashMap<String, String>,
}

/// An append-only store of raw pages with an in-memory index.
pub struct PageStore {
    /// The store directory.
    dir: PathBuf,
    /// The append-only blob file.
    blob: File,
    /// The append position.
    offset: u64,
    /// Title to page entry.
    pages: HashMap<String, PageEntry>,
    /// Redirect source title to target title.
    redirects: HashMap<String, String>,
    /// Canonical template name to normalized body.
    templates: HashMap<String, String>,
    /// The namespace table, for template and module prefix handling.
    name_data: Arc<NamespaceData>,
}

impl PageStore {
    /// Opens (or creates) the store in `dir`, loading the sidecar index if
    /// one exists.
    pub fn open(dir: impl Into<PathBuf>, name_data: Arc<NamespaceData>) -> Result<Self, Error> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|err| Error::Io(err, dir.clone()))?;

        let blob_path = dir.join("cache");
        let blob = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&blob_path)
            .map_err(|err| Error::Io(err, blob_path.clone()))?;
        let offset = blob
            .metadata()
            .map_err(|err| Error::Io(err, blob_path))?
            .len();

        let index_path = dir.join("cache.json");
        let index = if index_path.exists() {
            let file = File::open(&index_path).map_err(|err| Error::Io(err, index_path))?;
            serde_json::from_reader::<_, IndexIn>(BufReader::new(file))?
        } else {
            IndexIn::default()
        };

        Ok(Self {
            dir,
            blob,
            offset,
            pages: index.pages,
            redirects: index.redirects,
            templates: index.templates,
            name_data,
        })
    }

    /// Writes the sidecar index next to the blob file.
    pub fn save(&self) -> Result<(), Error> {
        let index_path = self.dir.join("cache.json");
        let file = File::create(&index_path).map_err(|err| Error::Io(err, index_path))?;
        serde_json::to_writer(
            BufWriter::new(file),
            &IndexOut {
                pages: &self.pages,
                redirects: &self.redirects,
                templates: &self.templates,
            },
        )?;
        Ok(())
    }

    /// Appends one page.
    ///
    /// Redirect pages use the model `redirect` with the target title as
    /// their text. Template pages are also normalized into the template
    /// table, except documentation and testcase subpages, which are only
    /// meaningful on the wiki itself.
    pub fn add(&mut self, model: &str, title: &str, text: &str) -> Result<(), Error> {
        let raw = text.as_bytes();
        self.blob
            .write_all_at(raw, self.offset)
            .map_err(|err| Error::Io(err, self.dir.join("cache")))?;
        self.pages.insert(
            title.to_string(),
            PageEntry {
                model: model.to_string(),
                offset: self.offset,
                len: raw.len() as u64,
            },
        );
        self.offset += raw.len() as u64;

        if model == "redirect" {
            self.redirects.insert(title.to_string(), text.to_string());
        } else if title.starts_with(&format!("{}:", self.name_data.name_of("Template"))) {
            if title.ends_with("/documentation") || title.ends_with("/testcases") {
                return Ok(());
            }
            self.add_template(title, text);
        }

        Ok(())
    }

    /// Normalizes and records a template body under its canonical name.
    pub fn add_template(&mut self, title: &str, text: &str) {
        let name = self.name_data.canonicalize_template_name(title);
        self.templates.insert(name, transclusion_body(text));
    }

    /// Returns true if the given title is in the template table.
    pub fn has_template(&self, title: &str) -> bool {
        self.templates
            .contains_key(&self.name_data.canonicalize_template_name(title))
    }

    /// Returns the normalized body of a template by canonical name.
    pub fn template_body(&self, name: &str) -> Option<&str> {
        self.templates.get(name).map(String::as_str)
    }

    /// Returns the redirect target of a page, if it is a redirect.
    pub fn redirect_target(&self, title: &str) -> Option<&str> {
        self.redirects.get(title).map(String::as_str)
    }

    /// Copies template bodies to their redirect sources, one hop, for every
    /// redirect whose both endpoints sit in the template namespace. Runs
    /// once between ingestion and expansion.
    pub fn resolve_template_redirects(&mut self) {
        let prefix = format!("{}:", self.name_data.name_of("Template"));
        let mut copies = vec![];

        for (from, to) in &self.redirects {
            if !from.starts_with(&prefix) || !to.starts_with(&prefix) {
                continue;
            }
            let from = self.name_data.canonicalize_template_name(from);
            let to = self.name_data.canonicalize_template_name(to);
            if !self.templates.contains_key(&from) && self.templates.contains_key(&to) {
                copies.push((from, to));
            }
        }

        for (from, to) in copies {
            if let Some(template_body) = self.templates.get(&to).cloned() {
                self.templates.insert(from, template_body);
            }
        }
    }

    /// Returns true if the given page exists.
    pub fn exists(&self, title: &str) -> bool {
        let title = title.strip_prefix("Main:").unwrap_or(title);
        if self.pages.contains_key(title) {
            return true;
        }

        // Module pages may be referred to by the canonical prefix while
        // being stored under the localized one.
        if let Some(rest) = title.strip_prefix("Module:") {
            return self
                .pages
                .contains_key(&format!("{}:{rest}", self.name_data.name_of("Module")));
        }

        false
    }

    /// Reads page contents. Returns `None` if the page does not exist or
    /// its bytes cannot be read back.
    pub fn read(&self, title: &str) -> Option<String> {
        let title = title.strip_prefix("Main:").unwrap_or(title);
        let entry = self.pages.get(title)?;

        // Clippy: Lengths were produced from in-memory strings.
        #[allow(clippy::cast_possible_truncation)]
        let mut buf = vec![0_u8; entry.len as usize];
        if let Err(err) = self.blob.read_exact_at(&mut buf, entry.offset) {
            log::error!("{title}: failed to read page bytes: {err}");
            return None;
        }
        String::from_utf8(buf).ok()
    }

    /// Iterates all stored pages as `(title, entry)`.
    pub fn pages(&self) -> impl Iterator<Item = (&str, &PageEntry)> {
        self.pages.iter().map(|(title, entry)| (title.as_str(), entry))
    }

    /// The number of stored pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns true if no pages are stored.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        path::Path,
        sync::atomic::{AtomicUsize, Ordering},
    };

    /// Makes a fresh scratch directory for one test.
    fn scratch_dir() -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "expand-rs-store-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn open_store(dir: &Path) -> PageStore {
        PageStore::open(dir, Arc::new(NamespaceData::english())).unwrap()
    }

    #[test]
    fn test_add_and_read() {
        let dir = scratch_dir();
        let mut store = open_store(&dir);
        store.add("wikitext", "Alpha", "alpha text").unwrap();
        store.add("wikitext", "Beta", "beta text").unwrap();

        assert!(store.exists("Alpha"));
        assert!(store.exists("Main:Alpha"), "the Main prefix is stripped");
        assert!(!store.exists("Gamma"));
        assert_eq!(store.read("Alpha").as_deref(), Some("alpha text"));
        assert_eq!(store.read("Beta").as_deref(), Some("beta text"));
        assert_eq!(store.read("Gamma"), None);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_template_normalization_at_ingest() {
        let dir = scratch_dir();
        let mut store = open_store(&dir);
        store
            .add(
                "wikitext",
                "Template:N",
                "<noinclude>hide</noinclude>keep<includeonly>show</includeonly>",
            )
            .unwrap();

        assert!(store.has_template("Template:N"));
        assert_eq!(store.template_body("N"), Some("keepshow"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_documentation_subpages_skipped() {
        let dir = scratch_dir();
        let mut store = open_store(&dir);
        store
            .add("wikitext", "Template:T/documentation", "docs")
            .unwrap();
        assert!(!store.has_template("Template:T/documentation"));
        assert!(
            store.exists("Template:T/documentation"),
            "the page itself is still stored"
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_redirect_resolution() {
        let dir = scratch_dir();
        let mut store = open_store(&dir);
        store.add("wikitext", "Template:T", "ok").unwrap();
        store.add("redirect", "Template:R", "Template:T").unwrap();
        store.resolve_template_redirects();

        assert_eq!(
            store.template_body("R"),
            Some("ok"),
            "the redirect source receives the target's body"
        );
        assert_eq!(store.redirect_target("Template:R"), Some("Template:T"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_redirected_template_expands() {
        let dir = scratch_dir();
        let mut store = open_store(&dir);
        store.add("wikitext", "Template:T", "ok").unwrap();
        store.add("redirect", "Template:R", "Template:T").unwrap();
        store.resolve_template_redirects();

        let name_data = Arc::new(NamespaceData::english());
        let mut ctx = crate::expand::PageContext::new(name_data, Arc::new(store));
        ctx.start_page("Test page");
        assert_eq!(ctx.expand("{{R}}", None, None), "ok");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_save_and_reopen() {
        let dir = scratch_dir();
        let mut store = open_store(&dir);
        store.add("wikitext", "Alpha", "alpha text").unwrap();
        store.add("wikitext", "Template:T", "body").unwrap();
        store.save().unwrap();
        drop(store);

        let store = open_store(&dir);
        assert_eq!(store.len(), 2);
        assert_eq!(store.read("Alpha").as_deref(), Some("alpha text"));
        assert_eq!(store.template_body("T"), Some("body"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
