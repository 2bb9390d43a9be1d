//! Match and descend predicates.
//!
//! The engine only sees the two traits. [`FileFilter`] and [`Browser`] are
//! the predicates a [`SearchQuery`](super::SearchQuery) builds; callers can
//! plug in their own.

use std::fmt;

use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use regex::RegexBuilder;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::query::SizeClause;
use crate::backends::tar::is_archive_name;
use crate::error::{VfsError, VfsResult};
use crate::node::{FileNode, is_hidden};
use crate::types::FileAttributes;

/// Decides whether a file goes into the results.
#[async_trait]
pub trait MatchPredicate: Send + Sync + fmt::Debug {
    async fn matches(&self, node: &dyn FileNode) -> bool;
}

/// Decides whether a directory (or archive) is listed at the next level.
#[async_trait]
pub trait DescendPredicate: Send + Sync + fmt::Debug {
    async fn descend(&self, node: &dyn FileNode) -> bool;
}

/// Accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchAll;

#[async_trait]
impl MatchPredicate for MatchAll {
    async fn matches(&self, _node: &dyn FileNode) -> bool {
        true
    }
}

/// Descends into directories only.
#[derive(Debug, Clone, Copy, Default)]
pub struct Directories;

#[async_trait]
impl DescendPredicate for Directories {
    async fn descend(&self, node: &dyn FileNode) -> bool {
        node.is_directory().await.unwrap_or(false)
    }
}

/// Attributes, or `None` when they cannot be read.
async fn attributes_of(node: &dyn FileNode) -> Option<FileAttributes> {
    match node.attributes().await {
        Ok(attrs) if attrs.exists => Some(attrs),
        Ok(_) => None,
        Err(e) => {
            debug!(locator = %node.locator().redacted(), error = %e, "skipping unreadable entry");
            None
        }
    }
}

/// File name matcher.
#[derive(Debug, Clone)]
pub enum NameMatcher {
    Any,
    Substring { needle: String, case_sensitive: bool },
    Glob { pattern: Pattern, case_sensitive: bool },
    Regex(regex::Regex),
}

impl NameMatcher {
    /// Globs for keywords with `*`, `?` or `[`, substrings otherwise.
    pub fn new(keyword: &str, case_sensitive: bool, regex: bool) -> VfsResult<Self> {
        if keyword.is_empty() {
            return Ok(Self::Any);
        }
        if regex {
            let re = RegexBuilder::new(keyword)
                .case_insensitive(!case_sensitive)
                .build()
                .map_err(|e| VfsError::InvalidSearch(format!("name pattern {keyword:?}: {e}")))?;
            return Ok(Self::Regex(re));
        }
        if keyword.contains(['*', '?', '[']) {
            let pattern = Pattern::new(keyword)
                .map_err(|e| VfsError::InvalidSearch(format!("glob {keyword:?}: {e}")))?;
            return Ok(Self::Glob {
                pattern,
                case_sensitive,
            });
        }
        let needle = if case_sensitive {
            keyword.to_string()
        } else {
            keyword.to_lowercase()
        };
        Ok(Self::Substring {
            needle,
            case_sensitive,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Substring {
                needle,
                case_sensitive: true,
            } => name.contains(needle.as_str()),
            Self::Substring { needle, .. } => name.to_lowercase().contains(needle.as_str()),
            Self::Glob {
                pattern,
                case_sensitive,
            } => pattern.matches_with(
                name,
                MatchOptions {
                    case_sensitive: *case_sensitive,
                    require_literal_separator: false,
                    require_literal_leading_dot: false,
                },
            ),
            Self::Regex(re) => re.is_match(name),
        }
    }
}

/// Content matcher over the first `max_bytes` of a file.
#[derive(Debug, Clone)]
pub struct TextMatcher {
    regex: regex::bytes::Regex,
    backward: bool,
    max_bytes: u64,
}

impl TextMatcher {
    pub fn new(
        text: &str,
        case_sensitive: bool,
        regex: bool,
        whole_words: bool,
        backward: bool,
        max_bytes: u64,
    ) -> VfsResult<Self> {
        let mut pattern = if regex {
            text.to_string()
        } else {
            regex::escape(text)
        };
        if whole_words {
            pattern = format!(r"\b(?:{pattern})\b");
        }
        let regex = regex::bytes::RegexBuilder::new(&pattern)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| VfsError::InvalidSearch(format!("text pattern {text:?}: {e}")))?;
        Ok(Self {
            regex,
            backward,
            max_bytes,
        })
    }

    /// Offset of the first match, or the last one when searching backward.
    pub fn find_in(&self, haystack: &[u8]) -> Option<usize> {
        if self.backward {
            self.regex.find_iter(haystack).last().map(|m| m.start())
        } else {
            self.regex.find(haystack).map(|m| m.start())
        }
    }

    /// Scan a file's contents.
    pub async fn find(&self, node: &dyn FileNode) -> VfsResult<Option<usize>> {
        let mut buf = Vec::new();
        node.input_stream()
            .await?
            .take(self.max_bytes)
            .read_to_end(&mut buf)
            .await?;
        Ok(self.find_in(&buf))
    }
}

/// Match predicate built from search options.
#[derive(Debug, Clone)]
pub struct FileFilter {
    pub name: NameMatcher,
    pub text: Option<TextMatcher>,
    pub sizes: Vec<SizeClause>,
    pub subfolders: bool,
    pub archives: bool,
    pub hidden: bool,
    pub symlinks: bool,
}

impl Default for FileFilter {
    fn default() -> Self {
        Self {
            name: NameMatcher::Any,
            text: None,
            sizes: Vec::new(),
            subfolders: true,
            archives: true,
            hidden: true,
            symlinks: true,
        }
    }
}

#[async_trait]
impl MatchPredicate for FileFilter {
    async fn matches(&self, node: &dyn FileNode) -> bool {
        let name = node.locator().name();
        if !self.name.matches(name) || (!self.hidden && is_hidden(node)) {
            return false;
        }
        let Some(attrs) = attributes_of(node).await else {
            return false;
        };
        if attrs.is_directory && !self.subfolders
            || attrs.is_symlink && !self.symlinks
            || !attrs.is_directory && !self.archives && is_archive_name(name)
        {
            return false;
        }
        if !self.sizes.iter().all(|clause| clause.accepts(&attrs)) {
            return false;
        }
        match &self.text {
            None => true,
            Some(_) if attrs.is_directory => false,
            Some(text) => match text.find(node).await {
                Ok(found) => found.is_some(),
                Err(e) => {
                    debug!(locator = %node.locator().redacted(), error = %e, "content scan failed");
                    false
                }
            },
        }
    }
}

/// Descend predicate built from search options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Browser {
    pub subfolders: bool,
    pub archives: bool,
    pub hidden: bool,
    pub symlinks: bool,
}

impl Default for Browser {
    fn default() -> Self {
        Self {
            subfolders: true,
            archives: false,
            hidden: false,
            symlinks: false,
        }
    }
}

#[async_trait]
impl DescendPredicate for Browser {
    async fn descend(&self, node: &dyn FileNode) -> bool {
        if !self.hidden && is_hidden(node) {
            return false;
        }
        let Some(attrs) = attributes_of(node).await else {
            return false;
        };
        if attrs.is_symlink && !self.symlinks {
            return false;
        }
        if attrs.is_directory {
            self.subfolders
        } else {
            self.archives && is_archive_name(node.locator().name())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_pick_the_matcher() {
        assert!(NameMatcher::new("", false, false).unwrap().matches("anything"));

        let sub = NameMatcher::new("Log", false, false).unwrap();
        assert!(sub.matches("system.LOG.1"));
        assert!(!NameMatcher::new("Log", true, false).unwrap().matches("x.log"));

        let glob = NameMatcher::new("*.log", false, false).unwrap();
        assert!(matches!(glob, NameMatcher::Glob { .. }));
        assert!(glob.matches("X.LOG"));
        assert!(!glob.matches("x.log.gz"));

        let re = NameMatcher::new(r"^\d+\.txt$", false, true).unwrap();
        assert!(re.matches("42.txt"));
        assert!(!re.matches("a42.txt"));

        let err = NameMatcher::new("(", false, true).unwrap_err();
        assert!(matches!(err, VfsError::InvalidSearch(_)));
    }

    #[test]
    fn text_direction_picks_the_occurrence() {
        let forward = TextMatcher::new("ab", false, false, false, false, 100).unwrap();
        let backward = TextMatcher::new("ab", false, false, false, true, 100).unwrap();
        assert_eq!(forward.find_in(b"xxABxxab"), Some(2));
        assert_eq!(backward.find_in(b"xxABxxab"), Some(6));
    }

    #[test]
    fn whole_words_and_literal_text() {
        let word = TextMatcher::new("cat", true, false, true, false, 100).unwrap();
        assert!(word.find_in(b"a cat sat").is_some());
        assert!(word.find_in(b"concatenate").is_none());

        let literal = TextMatcher::new("a.b", true, false, false, false, 100).unwrap();
        assert!(literal.find_in(b"axb").is_none());
        assert!(literal.find_in(b"a.b").is_some());
    }
}
