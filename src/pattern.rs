//! Address pattern matching: CSV mode and wildcard-trie mode, both with
//! `${user}` substitution, per §4.5 "Pattern match algorithm".

use std::collections::HashMap;

/// Performs the `${user}` substitution described in §4.5: if `candidate`
/// contains `user` as a substring, returns a variant with the first such
/// occurrence replaced by the literal `${user}`.
fn user_substituted(candidate: &str, user: &str) -> Option<String> {
    if user.is_empty() {
        return None;
    }
    candidate
        .find(user)
        .map(|idx| format!("{}${{user}}{}", &candidate[..idx], &candidate[idx + user.len()..]))
}

/// A compiled CSV pattern list: comma-separated tokens where `*` alone
/// matches anything, a trailing `*` is a prefix match, and anything else is
/// an exact match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvPatternSet {
    tokens: Vec<CsvToken>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CsvToken {
    MatchAll,
    Prefix(String),
    Exact(String),
}

impl CsvPatternSet {
    /// Compiles a CSV pattern string such as `"a.*,b"`.
    #[must_use]
    pub fn compile(csv: &str) -> Self {
        let tokens = csv
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| {
                if t == "*" {
                    CsvToken::MatchAll
                } else if let Some(prefix) = t.strip_suffix('*') {
                    CsvToken::Prefix(prefix.to_string())
                } else {
                    CsvToken::Exact(t.to_string())
                }
            })
            .collect();
        Self { tokens }
    }

    fn matches_literal(&self, candidate: &str) -> bool {
        self.tokens.iter().any(|token| match token {
            CsvToken::MatchAll => true,
            CsvToken::Prefix(prefix) => candidate.starts_with(prefix.as_str()),
            CsvToken::Exact(exact) => candidate == exact,
        })
    }

    /// Tests `candidate` against both the raw name and, if `user` appears as
    /// a substring of it, the `${user}`-substituted variant.
    #[must_use]
    pub fn matches(&self, candidate: &str, user: &str) -> bool {
        if self.matches_literal(candidate) {
            return true;
        }
        user_substituted(candidate, user).is_some_and(|subst| self.matches_literal(&subst))
    }
}

/// A node in the wildcard trie: `*` matches exactly one token, `#` matches
/// zero or more trailing tokens.
#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    star: Option<Box<TrieNode>>,
    hash_terminal: bool,
    terminal: bool,
}

/// A compiled tokenized wildcard trie over `.`-separated address segments.
#[derive(Debug, Default)]
pub struct WildcardPatternTree {
    root: TrieNode,
}

impl WildcardPatternTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a pattern such as `"a.*.c"` or `"a.#"`.
    pub fn insert(&mut self, pattern: &str) {
        let mut node = &mut self.root;
        let segments: Vec<&str> = pattern.split('.').collect();
        for (idx, segment) in segments.iter().enumerate() {
            if *segment == "#" {
                node.hash_terminal = true;
                return;
            } else if *segment == "*" {
                node = node.star.get_or_insert_with(|| Box::new(TrieNode::default()));
            } else {
                node = node
                    .children
                    .entry((*segment).to_string())
                    .or_default();
            }
            if idx == segments.len() - 1 {
                node.terminal = true;
            }
        }
    }

    fn matches_literal(&self, candidate: &str) -> bool {
        let segments: Vec<&str> = candidate.split('.').collect();
        Self::walk(&self.root, &segments)
    }

    fn walk(node: &TrieNode, remaining: &[&str]) -> bool {
        if node.hash_terminal {
            return true;
        }
        let Some((head, tail)) = remaining.split_first() else {
            return node.terminal;
        };
        if let Some(child) = node.children.get(*head) {
            if Self::walk(child, tail) {
                return true;
            }
        }
        if let Some(star) = &node.star {
            if Self::walk(star, tail) {
                return true;
            }
        }
        false
    }

    /// Tests `candidate` against both the raw name and its `${user}`
    /// substitution, per §4.5.
    #[must_use]
    pub fn matches(&self, candidate: &str, user: &str) -> bool {
        if self.matches_literal(candidate) {
            return true;
        }
        user_substituted(candidate, user).is_some_and(|subst| self.matches_literal(&subst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_round_trip_matches_spec_example() {
        // §8 invariant 6
        let set = CsvPatternSet::compile("a.*,b");
        assert!(set.matches("a.x", "nobody"));
        assert!(!set.matches("c", "nobody"));
    }

    #[test]
    fn csv_user_substitution_matches_when_pattern_contains_substituted_form() {
        let set = CsvPatternSet::compile("${user}.x");
        assert!(set.matches("u.x", "u"));
        assert!(!set.matches("v.x", "u"));
    }

    #[test]
    fn csv_match_all_token() {
        let set = CsvPatternSet::compile("*");
        assert!(set.matches("anything.at.all", "u"));
    }

    #[test]
    fn wildcard_tree_exact_and_star() {
        let mut tree = WildcardPatternTree::new();
        tree.insert("news.*.sports");
        assert!(tree.matches("news.us.sports", "u"));
        assert!(!tree.matches("news.us.weather", "u"));
    }

    #[test]
    fn wildcard_tree_hash_catch_all_suffix() {
        let mut tree = WildcardPatternTree::new();
        tree.insert("news.#");
        assert!(tree.matches("news.us.sports.baseball", "u"));
        assert!(tree.matches("news", "u"));
    }

    #[test]
    fn wildcard_tree_user_substitution() {
        let mut tree = WildcardPatternTree::new();
        tree.insert("${user}.inbox");
        assert!(tree.matches("alice.inbox", "alice"));
        assert!(!tree.matches("bob.inbox", "alice"));
    }
}
