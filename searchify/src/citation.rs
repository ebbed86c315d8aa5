//! Citation marker scanning
//!
//! Generated text references evidence with markers such as `[3]`. The scanner
//! runs over the *full* accumulated text on every chunk so that a marker split
//! across two deltas is picked up as soon as its closing bracket arrives.
//!
//! Malformed markers are skipped, never reported: unclosed brackets, ids with
//! characters outside the grammar, and markers wrapped in another bracket
//! (`[[1]]`, `[1[2]]`).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Ids longer than this are treated as malformed.
pub const MAX_CITATION_ID_LEN: usize = 64;

static NUMERIC_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([0-9]+)\]").unwrap());

static TOKEN_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([A-Za-z0-9_-]+)\]").unwrap());

/// Accepted shape of the id between the brackets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdGrammar {
    /// One or more ASCII digits
    #[default]
    Numeric,
    /// ASCII letters, digits, `_` and `-`
    Token,
}

impl IdGrammar {
    fn pattern(self) -> &'static Regex {
        match self {
            IdGrammar::Numeric => &NUMERIC_MARKER,
            IdGrammar::Token => &TOKEN_MARKER,
        }
    }
}

/// Distinct ids referenced by a text snapshot.
///
/// Membership is order-insensitive; iteration yields ids in order of first
/// appearance, which is the order search results are emitted in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CitationSet {
    ordered: Vec<String>,
    members: HashSet<String>,
}

impl CitationSet {
    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ordered.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    fn insert(&mut self, id: &str) {
        if self.members.insert(id.to_string()) {
            self.ordered.push(id.to_string());
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CitationScanner {
    grammar: IdGrammar,
}

impl CitationScanner {
    pub fn new(grammar: IdGrammar) -> Self {
        Self { grammar }
    }

    pub fn scan(&self, text: &str) -> CitationSet {
        let bytes = text.as_bytes();
        let mut found = CitationSet::default();

        for caps in self.grammar.pattern().captures_iter(text) {
            let (Some(marker), Some(id)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            // nested: `[[1]]`, `[1[2]]`, `[2]]`
            if marker.start() > 0 && bytes[marker.start() - 1] == b'[' {
                continue;
            }
            if bytes.get(marker.end()) == Some(&b']') {
                continue;
            }
            if id.as_str().len() > MAX_CITATION_ID_LEN {
                continue;
            }
            found.insert(id.as_str());
        }

        found
    }
}
