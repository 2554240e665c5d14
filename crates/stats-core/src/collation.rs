//! Title collation for French-language display lists.
//!
//! Titles are decomposed (NFD) and compared on three levels, as in the
//! Unicode Collation Algorithm for Latin script:
//!
//! 1. base letters, ignoring accents and case (`é` = `e`, `Œ` = `oe`);
//! 2. accents, unaccented first;
//! 3. case, lowercase first.
//!
//! Remaining ties fall back to code-point order so the result is total.

use std::cmp::Ordering;

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Letters with no canonical decomposition that still sort as two letters.
fn expand_ligature(c: char) -> Option<&'static str> {
    match c {
        'æ' => Some("ae"),
        'œ' => Some("oe"),
        'ß' => Some("ss"),
        _ => None,
    }
}

/// Sort key of a title; comparing keys compares titles level by level.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CollationKey {
    primary: String,
    /// Combining marks attached to each primary letter.
    secondary: Vec<Vec<char>>,
    tertiary: Vec<bool>,
}

impl CollationKey {
    fn push(&mut self, base: char, mark: Option<char>, upper: bool) {
        self.primary.push(base);
        self.secondary.push(mark.into_iter().collect());
        self.tertiary.push(upper);
    }
}

/// Build the collation key of `text`.
pub fn collation_key(text: &str) -> CollationKey {
    let mut key = CollationKey {
        primary: String::with_capacity(text.len()),
        secondary: Vec::with_capacity(text.len()),
        tertiary: Vec::with_capacity(text.len()),
    };

    for c in text.nfd() {
        if is_combining_mark(c) {
            match key.secondary.last_mut() {
                Some(marks) => marks.push(c),
                // A leading mark has no letter to attach to.
                None => key.push(c, None, false),
            }
            continue;
        }

        let upper = c.is_uppercase();
        for lower in c.to_lowercase() {
            if is_combining_mark(lower) {
                if let Some(marks) = key.secondary.last_mut() {
                    marks.push(lower);
                }
                continue;
            }
            match expand_ligature(lower) {
                // The ligature itself is the accent of its first letter, so
                // "Œuvre" sorts right after "Oeuvre".
                Some(expansion) => {
                    for (i, base) in expansion.chars().enumerate() {
                        key.push(base, (i == 0).then_some(lower), upper);
                    }
                }
                None => key.push(lower, None, upper),
            }
        }
    }

    key
}

/// Compare two titles under French collation.
pub fn compare_titles(a: &str, b: &str) -> Ordering {
    collation_key(a)
        .cmp(&collation_key(b))
        .then_with(|| a.cmp(b))
}
