//! The per-page cookie table.

use super::{Cookie, MAX_COOKIES};
use indexmap::IndexSet;

/// A content-addressed table of encoded constructs.
///
/// Indices are dense starting at zero, which is what allows a cookie to be
/// rendered as `BASE + index`. Interning means equal constructs share one
/// index, so heavily repeated constructs (citation templates and the like)
/// cost one entry instead of thousands.
#[derive(Debug, Default)]
pub(super) struct CookieTable {
    /// The interned cookies, in allocation order.
    cookies: IndexSet<Cookie>,
}

impl CookieTable {
    /// Interns a cookie, returning its dense index.
    ///
    /// Returns `None` when a *new* entry would exceed the table bound;
    /// lookups of already-interned cookies always succeed.
    pub(super) fn intern(&mut self, cookie: Cookie) -> Option<usize> {
        if let Some(index) = self.cookies.get_index_of(&cookie) {
            return Some(index);
        }
        if self.cookies.len() >= MAX_COOKIES {
            return None;
        }
        Some(self.cookies.insert_full(cookie).0)
    }

    /// Returns the cookie at the given index.
    pub(super) fn get(&self, index: usize) -> Option<&Cookie> {
        self.cookies.get_index(index)
    }

    /// The number of interned cookies.
    pub(super) fn len(&self) -> usize {
        self.cookies.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expand::CookieKind;

    fn cookie(name: &str) -> Cookie {
        Cookie {
            kind: CookieKind::Template,
            args: vec![name.to_string()],
            nowiki: false,
        }
    }

    #[test]
    fn test_interning() {
        let mut table = CookieTable::default();
        let a = table.intern(cookie("a"));
        let b = table.intern(cookie("b"));
        let a2 = table.intern(cookie("a"));
        assert_eq!(a, Some(0));
        assert_eq!(b, Some(1));
        assert_eq!(a, a2, "equal cookies should share one index");
        assert_eq!(table.len(), 2, "interning should not grow the table");
    }

    #[test]
    fn test_distinct_by_nowiki() {
        let mut table = CookieTable::default();
        let plain = table.intern(cookie("a"));
        let marked = table.intern(Cookie {
            nowiki: true,
            ..cookie("a")
        });
        assert_ne!(plain, marked, "the nowiki flag is part of the identity");
    }

    #[test]
    fn test_lookup() {
        let mut table = CookieTable::default();
        table.intern(cookie("a"));
        assert_eq!(table.get(0), Some(&cookie("a")));
        assert_eq!(table.get(1), None);
    }
}
