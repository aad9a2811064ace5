//! Canonical name ordering and wildcard matching.
//!
//! Directory enumeration must hand entries to the engine in the engine's own
//! collation order, and filter patterns must match the way the engine matches
//! them when it merges local and projected entries. On Windows the binding
//! supplies a [`NameCollation`] backed by the native ProjFS routines;
//! [`DefaultCollation`] is the platform-equivalent fallback: case-insensitive
//! ordinal comparison plus DOS wildcard semantics.

use std::cmp::Ordering;

/// Name comparison and matching rules used for enumeration.
pub trait NameCollation: Send + Sync {
    /// Orders two file names the way the engine expects enumeration results.
    fn compare(&self, a: &str, b: &str) -> Ordering;

    /// Returns true if `name` matches `pattern`.
    ///
    /// An empty pattern or `*` matches everything.
    fn matches(&self, name: &str, pattern: &str) -> bool;

    /// Returns true if `pattern` contains wildcard characters.
    fn is_wildcard(&self, pattern: &str) -> bool;
}

/// Returns true for patterns that place no restriction on names.
pub fn is_match_all(pattern: &str) -> bool {
    let trimmed = pattern.trim();
    trimmed.is_empty() || trimmed == "*"
}

/// Case-insensitive ordinal collation with DOS wildcard matching.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCollation;

impl NameCollation for DefaultCollation {
    fn compare(&self, a: &str, b: &str) -> Ordering {
        a.chars()
            .map(fold)
            .cmp(b.chars().map(fold))
            .then_with(|| a.cmp(b))
    }

    fn matches(&self, name: &str, pattern: &str) -> bool {
        if is_match_all(pattern) {
            return true;
        }
        let pattern: Vec<char> = pattern.chars().map(fold).collect();
        let name: Vec<char> = name.chars().map(fold).collect();
        dos_match(&pattern, &name)
    }

    fn is_wildcard(&self, pattern: &str) -> bool {
        pattern.chars().any(|c| matches!(c, '*' | '?' | '<' | '>' | '"'))
    }
}

fn fold(c: char) -> char {
    let mut upper = c.to_uppercase();
    match (upper.next(), upper.next()) {
        (Some(u), None) => u,
        _ => c,
    }
}

// `<` is DOS_STAR, `>` is DOS_QM and `"` is DOS_DOT.
//
// Bottom-up over pattern suffixes: `next[j]` holds whether `pattern[i + 1..]`
// matches `name[j..]`, so the whole match is O(pattern * name).
fn dos_match(pattern: &[char], name: &[char]) -> bool {
    let n = name.len();
    let last_dot = name.iter().rposition(|&c| c == '.');

    let mut next: Vec<bool> = (0..=n).map(|j| j == n).collect();
    let mut cur = vec![false; n + 1];

    for &p in pattern.iter().rev() {
        for j in (0..=n).rev() {
            let at = name.get(j).copied();
            cur[j] = match p {
                '*' => next[j] || (j < n && cur[j + 1]),
                '<' => {
                    // Never consumes the final period of the name.
                    let bound = match last_dot {
                        Some(dot) if dot >= j => dot,
                        _ => n,
                    };
                    next[j] || (j < bound && cur[j + 1])
                }
                '?' => j < n && next[j + 1],
                '>' => match at {
                    None | Some('.') => next[j],
                    Some(_) => next[j + 1],
                },
                '"' => match at {
                    Some('.') => next[j + 1],
                    None => next[j],
                    Some(_) => false,
                },
                literal => at == Some(literal) && next[j + 1],
            };
        }
        std::mem::swap(&mut next, &mut cur);
    }

    next[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_case_insensitive() {
        let c = DefaultCollation;
        // Names equal ignoring case fall back to ordinal order.
        assert_eq!(c.compare("readme.txt", "README.TXT"), Ordering::Greater);
        assert_eq!(c.compare("a", "B"), Ordering::Less);
        assert_eq!(c.compare("B", "a"), Ordering::Greater);
        assert_eq!(c.compare("img", "readme.txt"), Ordering::Less);
        assert_eq!(c.compare("same", "same"), Ordering::Equal);
    }

    #[test]
    fn test_sort_is_total_and_repeatable() {
        let c = DefaultCollation;
        let names = ["b.txt", "A.txt", "a.txt", "_x", "Zeta", "alpha", "10", "9"];

        let mut first: Vec<&str> = names.to_vec();
        first.sort_by(|a, b| c.compare(a, b));

        let mut reversed: Vec<&str> = names.iter().rev().copied().collect();
        reversed.sort_by(|a, b| c.compare(a, b));

        assert_eq!(first, reversed);
        assert_eq!(first, vec!["10", "9", "A.txt", "a.txt", "alpha", "b.txt", "Zeta", "_x"]);
    }

    #[test]
    fn test_match_all_patterns() {
        let c = DefaultCollation;
        assert!(c.matches("anything", ""));
        assert!(c.matches("anything", "*"));
        assert!(c.matches("anything", "  "));
    }

    #[test]
    fn test_exact_match_ignores_case() {
        let c = DefaultCollation;
        assert!(c.matches("ReadMe.TXT", "readme.txt"));
        assert!(!c.matches("readme.txt", "readme.md"));
    }

    #[test]
    fn test_star_and_question_mark() {
        let c = DefaultCollation;
        assert!(c.matches("readme.txt", "*.txt"));
        assert!(c.matches("readme.txt", "read??.txt"));
        assert!(!c.matches("readme.txt", "read?.txt"));
        assert!(c.matches("archive.tar.gz", "*.gz"));
        assert!(!c.matches("img", "*.txt"));
    }

    #[test]
    fn test_dos_wildcards() {
        let c = DefaultCollation;
        // DOS_STAR stops at the final period.
        assert!(c.matches("archive.tar.gz", "<.gz"));
        assert!(!c.matches("archive.tar.gz", "<gz"));
        assert!(c.matches("noext", "<"));
        // DOS_QM matches zero characters at a period or end of name.
        assert!(c.matches("ab.txt", "ab>>.txt"));
        assert!(c.matches("ab", "ab>"));
        // DOS_DOT matches a period or the end of the name.
        assert!(c.matches("file", "file\""));
        assert!(c.matches("file.", "file\""));
        assert!(!c.matches("filex", "file\""));
    }

    #[test]
    fn test_is_wildcard() {
        let c = DefaultCollation;
        assert!(c.is_wildcard("*.txt"));
        assert!(c.is_wildcard("a?c"));
        assert!(c.is_wildcard("<.gz"));
        assert!(!c.is_wildcard("readme.txt"));
    }

    #[test]
    fn test_many_stars_do_not_backtrack() {
        let c = DefaultCollation;
        let name = "a".repeat(60);
        let started = std::time::Instant::now();
        assert!(!c.matches(&name, "*a*a*a*a*a*a*b"));
        assert!(!c.matches(&name, "<a<a<a<a<a<a<b"));
        assert!(c.matches(&name, "*a*a*a*a*a*a*"));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_dos_star_final_period_bound() {
        let c = DefaultCollation;
        assert!(c.matches("a.b.c", "<.c"));
        assert!(!c.matches("a.b.c", "<c"));
        assert!(!c.matches("a.b", "<b"));
        assert!(c.matches("a.b", "<.<"));
        assert!(!c.matches("a.b", "<"));
    }
}
