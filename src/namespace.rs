//! Namespace metadata and name canonicalization.
//!
//! Namespace tables are loaded from a JSON mapping of canonical namespace
//! name to `{id, name, issubject, content, istalk, aliases[]}`, one table per
//! language. The table drives the `Template:`/`Module:` prefix handling of
//! the page store and the name canonicalizers used by the expander.

use crate::common::collapse_whitespace;
use indexmap::IndexMap;
use serde::Deserialize;
use std::{collections::HashMap, fs::File, io::BufReader, path::Path};
use unicase::UniCase;

/// Errors that may occur when loading a namespace table.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The namespace file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The namespace file was not valid namespace JSON.
    #[error("namespace JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One namespace entry as it appears in the JSON table.
#[derive(Debug, Deserialize)]
struct RawNamespace {
    /// The numeric namespace ID.
    id: i32,
    /// The localized namespace name.
    name: String,
    /// Whether this is a subject (non-talk) namespace.
    issubject: bool,
    /// Whether pages in this namespace are site content.
    content: bool,
    /// Whether this is a talk namespace.
    istalk: bool,
    /// Alternative names accepted for this namespace.
    aliases: Vec<String>,
}

/// A single wiki namespace.
#[derive(Debug)]
pub struct Namespace {
    /// The numeric namespace ID.
    pub id: i32,
    /// The localized namespace name. Empty for the main namespace.
    pub name: String,
    /// The canonical (language-independent) namespace name.
    pub canonical_name: String,
    /// Whether this is a subject (non-talk) namespace.
    pub is_subject: bool,
    /// Whether pages in this namespace are site content.
    pub is_content: bool,
    /// Whether this is a talk namespace.
    pub is_talk: bool,
    /// Alternative names accepted for this namespace.
    pub aliases: Vec<String>,
    /// The ID of the paired talk namespace, for content namespaces.
    pub talk: Option<i32>,
    /// The ID of the paired subject namespace, for talk namespaces.
    pub subject: Option<i32>,
}

impl Namespace {
    /// Returns true if `name` designates this namespace, either by ID or by
    /// any of its names. Name comparison is case-insensitive.
    fn matches(&self, name: &str) -> bool {
        if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
            return name.parse::<i32>().is_ok_and(|id| id == self.id);
        }

        let name = UniCase::new(name);
        name == UniCase::new(self.name.as_str())
            || name == UniCase::new(self.canonical_name.as_str())
            || self
                .aliases
                .iter()
                .any(|alias| name == UniCase::new(alias.as_str()))
    }
}

/// A language's namespace table.
#[derive(Debug)]
pub struct NamespaceData {
    /// Namespaces keyed by canonical name, in table order.
    by_canonical: IndexMap<String, i32>,
    /// Namespaces keyed by ID.
    namespaces: HashMap<i32, Namespace>,
}

impl NamespaceData {
    /// Loads a namespace table from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = BufReader::new(File::open(path)?);
        Ok(Self::from_raw(serde_json::from_reader(file)?))
    }

    /// Returns the bundled English namespace table.
    pub fn english() -> Self {
        // The bundled table is validated by the test suite, so a parse
        // failure here is a build defect rather than a runtime condition.
        let raw = serde_json::from_str(include_str!("../res/namespaces/en.json"))
            .expect("bundled namespace table parses");
        Self::from_raw(raw)
    }

    /// Builds the table from the raw JSON form, linking subject and talk
    /// namespace pairs.
    fn from_raw(raw: IndexMap<String, RawNamespace>) -> Self {
        let mut by_canonical = IndexMap::with_capacity(raw.len());
        let mut namespaces = HashMap::with_capacity(raw.len());

        for (canonical, ns) in raw {
            by_canonical.insert(canonical.clone(), ns.id);
            namespaces.insert(
                ns.id,
                Namespace {
                    id: ns.id,
                    name: ns.name,
                    canonical_name: canonical,
                    is_subject: ns.issubject,
                    is_content: ns.content,
                    is_talk: ns.istalk,
                    aliases: ns.aliases,
                    talk: None,
                    subject: None,
                },
            );
        }

        let ids = namespaces.keys().copied().collect::<Vec<_>>();
        for id in ids {
            let (is_content, is_talk) = {
                let ns = &namespaces[&id];
                (ns.is_content, ns.is_talk)
            };
            if is_content && id >= 0 && namespaces.contains_key(&(id + 1)) {
                if let Some(ns) = namespaces.get_mut(&id) {
                    ns.talk = Some(id + 1);
                }
            } else if is_talk && namespaces.contains_key(&(id - 1)) {
                if let Some(ns) = namespaces.get_mut(&id) {
                    ns.subject = Some(id - 1);
                }
            }
        }

        Self {
            by_canonical,
            namespaces,
        }
    }

    /// Looks up the namespace designated by `name`.
    ///
    /// If `name` contains a colon, only the part before the colon is
    /// considered, so a full title may be passed. Returns `None` when the
    /// prefix does not name a namespace.
    pub fn get(&self, name: &str) -> Option<&Namespace> {
        let name = name.split(':').next().unwrap_or(name);

        if let Some(id) = self.by_canonical.get(name) {
            return self.namespaces.get(id);
        }

        self.namespaces.values().find(|ns| ns.matches(name))
    }

    /// Looks up a namespace by its numeric ID.
    pub fn by_id(&self, id: i32) -> Option<&Namespace> {
        self.namespaces.get(&id)
    }

    /// Returns the localized name of the namespace with the given canonical
    /// name, falling back to the canonical name itself when the table has no
    /// such entry.
    pub fn name_of<'a>(&'a self, canonical: &'a str) -> &'a str {
        self.by_canonical
            .get(canonical)
            .and_then(|id| self.namespaces.get(id))
            .map_or(canonical, |ns| ns.name.as_str())
    }

    /// Canonicalizes a parser function name.
    ///
    /// Underscores become spaces and whitespace is collapsed. Registered
    /// names are kept as-is; anything else is lowercased, since parser
    /// function names are case-insensitive except where the registry says
    /// otherwise.
    pub fn canonicalize_parserfn_name(&self, name: &str) -> String {
        let name = collapse_whitespace(&name.replace('_', " "));
        if crate::expand::parser_fns::is_parser_fn(&name) {
            name
        } else {
            name.to_lowercase()
        }
    }

    /// Canonicalizes a template name.
    ///
    /// Strips a localized `Template:` prefix case-insensitively, normalizes
    /// underscores to spaces, percent-encodes the four characters that would
    /// collide with template invocation syntax elsewhere in the pipeline,
    /// and collapses whitespace.
    pub fn canonicalize_template_name(&self, name: &str) -> String {
        let prefix = format!("{}:", self.name_of("Template").to_lowercase());
        let name = match name.get(..prefix.len()) {
            Some(head) if head.to_lowercase() == prefix => &name[prefix.len()..],
            _ => name,
        };

        let name = name
            .replace('_', " ")
            .replace('(', "%28")
            .replace(')', "%29")
            .replace('&', "%26")
            .replace('+', "%2B");

        collapse_whitespace(&name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let data = NamespaceData::english();
        assert_eq!(data.get("Template").map(|ns| ns.id), Some(10));
        assert_eq!(
            data.get("template").map(|ns| ns.id),
            Some(10),
            "lookup should be case-insensitive"
        );
        assert_eq!(
            data.get("Image").map(|ns| ns.id),
            Some(6),
            "aliases should resolve"
        );
        assert_eq!(
            data.get("10").map(|ns| ns.id),
            Some(10),
            "numeric names should resolve by ID"
        );
        assert_eq!(
            data.get("Template:Foo").map(|ns| ns.id),
            Some(10),
            "full titles should resolve by their prefix"
        );
        assert!(data.get("No such namespace").is_none());
    }

    #[test]
    fn test_talk_linking() {
        let data = NamespaceData::english();
        assert_eq!(
            data.get("Main").and_then(|ns| ns.talk),
            Some(1),
            "the main namespace should link to its talk namespace"
        );
        assert_eq!(
            data.get("Talk").and_then(|ns| ns.subject),
            Some(0),
            "talk namespaces should link back to their subject"
        );
    }

    #[test]
    fn test_canonicalize_template_name() {
        let data = NamespaceData::english();
        assert_eq!(data.canonicalize_template_name("Template:Foo bar"), "Foo bar");
        assert_eq!(
            data.canonicalize_template_name("template:foo_bar"),
            "foo bar",
            "prefix stripping should be case-insensitive"
        );
        assert_eq!(
            data.canonicalize_template_name("A (b) & c + d"),
            "A %28b%29 %26 c %2B d",
            "syntax-colliding characters should be percent-encoded"
        );
        assert_eq!(
            data.canonicalize_template_name("  a \t b  "),
            "a b",
            "whitespace should collapse"
        );
    }

    #[test]
    fn test_canonicalize_parserfn_name() {
        let data = NamespaceData::english();
        assert_eq!(data.canonicalize_parserfn_name("#IF"), "#if");
        assert_eq!(
            data.canonicalize_parserfn_name("lc"),
            "lc",
            "registered names should pass through"
        );
        assert_eq!(data.canonicalize_parserfn_name(" unknown_name "), "unknown name");
    }
}
