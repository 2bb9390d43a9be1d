//! Search options and their locator encoding.
//!
//! `search://host/path?q=*.log&depth=2&size=gt,10,kB` searches the tree at
//! `file://host/path`. Only options that differ from the defaults are
//! written back out, so a default query serializes to nothing.

use std::fmt;
use std::str::FromStr;

use strum::{Display, EnumString};
use tracing::debug;

use super::engine::SearchDepth;
use super::predicate::{Browser, FileFilter, NameMatcher, TextMatcher};
use crate::error::{VfsError, VfsResult};
use crate::locator::Locator;
use crate::types::FileAttributes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum SizeRelation {
    Eq,
    Gt,
    Lt,
}

/// Size units, in binary multiples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum SizeUnit {
    #[strum(serialize = "B")]
    Bytes,
    #[strum(serialize = "kB")]
    Kilo,
    #[strum(serialize = "MB")]
    Mega,
    #[strum(serialize = "GB")]
    Giga,
}

impl SizeUnit {
    pub fn bytes(self) -> u64 {
        match self {
            Self::Bytes => 1,
            Self::Kilo => 1 << 10,
            Self::Mega => 1 << 20,
            Self::Giga => 1 << 30,
        }
    }
}

/// `relation,value,unit`, e.g. `gt,10,kB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClause {
    pub relation: SizeRelation,
    pub value: u64,
    pub unit: SizeUnit,
}

impl SizeClause {
    pub fn new(relation: SizeRelation, value: u64, unit: SizeUnit) -> Self {
        Self {
            relation,
            value,
            unit,
        }
    }

    pub fn threshold(&self) -> u64 {
        self.value.saturating_mul(self.unit.bytes())
    }

    /// Directories never satisfy a size clause.
    pub fn accepts(&self, attrs: &FileAttributes) -> bool {
        if attrs.is_directory {
            return false;
        }
        let limit = self.threshold();
        match self.relation {
            SizeRelation::Eq => attrs.size == limit,
            SizeRelation::Gt => attrs.size > limit,
            SizeRelation::Lt => attrs.size < limit,
        }
    }
}

impl FromStr for SizeClause {
    type Err = VfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| VfsError::InvalidSearch(format!("size clause {s:?}: {why}"));
        let mut parts = s.split(',').map(str::trim);
        let (Some(relation), Some(value), Some(unit), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid("expected relation,value,unit"));
        };
        Ok(Self {
            relation: relation.parse().map_err(|_| invalid("relation must be eq, gt or lt"))?,
            value: value.parse().map_err(|_| invalid("value must be a whole number"))?,
            unit: unit.parse().map_err(|_| invalid("unit must be B, kB, MB or GB"))?,
        })
    }
}

impl fmt::Display for SizeClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.relation, self.value, self.unit)
    }
}

/// Everything a search locator can say.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    /// File name keyword; empty matches every name.
    pub keyword: String,
    pub case_sensitive: bool,
    pub regex: bool,

    // Where to look.
    pub in_subfolders: bool,
    pub in_archives: bool,
    pub in_hidden: bool,
    pub in_symlinks: bool,

    // What to collect.
    pub for_subfolders: bool,
    pub for_archives: bool,
    pub for_hidden: bool,
    pub for_symlinks: bool,

    pub depth: SearchDepth,
    /// `None` uses the configured default.
    pub threads: Option<usize>,

    pub text: Option<String>,
    pub text_case_sensitive: bool,
    pub text_regex: bool,
    pub text_whole_words: bool,
    pub text_backward: bool,

    pub sizes: Vec<SizeClause>,

    /// Scheme of the tree being searched.
    pub target_scheme: String,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            keyword: String::new(),
            case_sensitive: false,
            regex: false,
            in_subfolders: true,
            in_archives: false,
            in_hidden: false,
            in_symlinks: false,
            for_subfolders: true,
            for_archives: true,
            for_hidden: true,
            for_symlinks: true,
            depth: SearchDepth::Unlimited,
            threads: None,
            text: None,
            text_case_sensitive: false,
            text_regex: false,
            text_whole_words: false,
            text_backward: false,
            sizes: Vec::new(),
            target_scheme: "file".to_string(),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> VfsResult<bool> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(VfsError::InvalidSearch(format!("{key}: expected true or false, got {value:?}"))),
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> VfsResult<T> {
    value
        .parse()
        .map_err(|_| VfsError::InvalidSearch(format!("{key}: expected a number, got {value:?}")))
}

impl SearchQuery {
    /// Options from decoded `key=value` pairs. Unknown keys are ignored.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> VfsResult<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut q = Self::default();
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "q" => q.keyword = value.to_string(),
                "case" => q.case_sensitive = parse_bool(key, value)?,
                "regex" => q.regex = parse_bool(key, value)?,
                "subfolders" => q.in_subfolders = parse_bool(key, value)?,
                "archives" => q.in_archives = parse_bool(key, value)?,
                "hidden" => q.in_hidden = parse_bool(key, value)?,
                "symlinks" => q.in_symlinks = parse_bool(key, value)?,
                "filter_subfolders" => q.for_subfolders = parse_bool(key, value)?,
                "filter_archives" => q.for_archives = parse_bool(key, value)?,
                "filter_hidden" => q.for_hidden = parse_bool(key, value)?,
                "filter_symlinks" => q.for_symlinks = parse_bool(key, value)?,
                "depth" => q.depth = SearchDepth::from_encoded(parse_number(key, value)?),
                "threads" => {
                    let threads: usize = parse_number(key, value)?;
                    if threads == 0 {
                        return Err(VfsError::InvalidSearch("threads must be at least 1".into()));
                    }
                    q.threads = Some(threads);
                }
                "text" => q.text = Some(value.to_string()).filter(|t| !t.is_empty()),
                "text_case" => q.text_case_sensitive = parse_bool(key, value)?,
                "text_regex" => q.text_regex = parse_bool(key, value)?,
                "text_whole_words" => q.text_whole_words = parse_bool(key, value)?,
                "text_backward" => q.text_backward = parse_bool(key, value)?,
                "size" => q.sizes.push(value.parse()?),
                "in" => q.target_scheme = value.to_ascii_lowercase(),
                other => debug!(key = other, "ignoring unknown search option"),
            }
        }
        Ok(q)
    }

    pub fn from_locator(locator: &Locator) -> VfsResult<Self> {
        Self::from_pairs(locator.query_pairs())
    }

    /// Non-default options as `key=value` pairs, in a fixed order.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let d = Self::default();
        let mut pairs = Vec::new();
        let mut flag = |key: &'static str, value: bool, default: bool| {
            if value != default {
                pairs.push((key, value.to_string()));
            }
        };
        flag("case", self.case_sensitive, d.case_sensitive);
        flag("regex", self.regex, d.regex);
        flag("subfolders", self.in_subfolders, d.in_subfolders);
        flag("archives", self.in_archives, d.in_archives);
        flag("hidden", self.in_hidden, d.in_hidden);
        flag("symlinks", self.in_symlinks, d.in_symlinks);
        flag("filter_subfolders", self.for_subfolders, d.for_subfolders);
        flag("filter_archives", self.for_archives, d.for_archives);
        flag("filter_hidden", self.for_hidden, d.for_hidden);
        flag("filter_symlinks", self.for_symlinks, d.for_symlinks);
        flag("text_case", self.text_case_sensitive, d.text_case_sensitive);
        flag("text_regex", self.text_regex, d.text_regex);
        flag("text_whole_words", self.text_whole_words, d.text_whole_words);
        flag("text_backward", self.text_backward, d.text_backward);

        if !self.keyword.is_empty() {
            pairs.insert(0, ("q", self.keyword.clone()));
        }
        if self.depth != d.depth {
            pairs.push(("depth", self.depth.encoded().to_string()));
        }
        if let Some(threads) = self.threads {
            pairs.push(("threads", threads.to_string()));
        }
        if let Some(text) = &self.text {
            pairs.push(("text", text.clone()));
        }
        pairs.extend(self.sizes.iter().map(|s| ("size", s.to_string())));
        if self.target_scheme != d.target_scheme {
            pairs.push(("in", self.target_scheme.clone()));
        }
        pairs
    }

    /// A `search://` locator rooted at `target`.
    pub fn to_locator(&self, target: &Locator) -> Locator {
        let mut query = self.clone();
        query.target_scheme = target.scheme().to_string();
        let base = target.with_scheme("search");
        let pairs = query.to_pairs();
        if pairs.is_empty() {
            base.with_query(None)
        } else {
            base.with_query_pairs(pairs)
        }
    }

    /// The match predicate these options describe.
    pub fn filter(&self, max_text_bytes: u64) -> VfsResult<FileFilter> {
        let text = self
            .text
            .as_deref()
            .map(|text| {
                TextMatcher::new(
                    text,
                    self.text_case_sensitive,
                    self.text_regex,
                    self.text_whole_words,
                    self.text_backward,
                    max_text_bytes,
                )
            })
            .transpose()?;
        Ok(FileFilter {
            name: NameMatcher::new(&self.keyword, self.case_sensitive, self.regex)?,
            text,
            sizes: self.sizes.clone(),
            subfolders: self.for_subfolders,
            archives: self.for_archives,
            hidden: self.for_hidden,
            symlinks: self.for_symlinks,
        })
    }

    /// The descend predicate these options describe.
    pub fn browser(&self) -> Browser {
        Browser {
            subfolders: self.in_subfolders,
            archives: self.in_archives,
            hidden: self.in_hidden,
            symlinks: self.in_symlinks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_query_serializes_to_nothing() {
        assert!(SearchQuery::default().to_pairs().is_empty());
        let target = Locator::parse("file:///var/log").unwrap();
        let loc = SearchQuery::default().to_locator(&target);
        assert_eq!(loc.to_string(), "search:///var/log");
    }

    #[test]
    fn only_changed_options_are_written() {
        let query = SearchQuery {
            keyword: "*.log".into(),
            in_archives: true,
            depth: SearchDepth::Levels(2),
            sizes: vec![SizeClause::new(SizeRelation::Gt, 10, SizeUnit::Kilo)],
            ..SearchQuery::default()
        };
        let pairs = query.to_pairs();
        assert_eq!(
            pairs,
            vec![
                ("q", "*.log".to_string()),
                ("archives", "true".to_string()),
                ("depth", "2".to_string()),
                ("size", "gt,10,kB".to_string()),
            ]
        );

        let loc = query.to_locator(&Locator::parse("sftp://host/srv").unwrap());
        let parsed = SearchQuery::from_locator(&loc).unwrap();
        assert_eq!(parsed.target_scheme, "sftp");
        assert_eq!(parsed.keyword, "*.log");
        assert_eq!(parsed.sizes, query.sizes);
        assert_eq!(parsed.depth, SearchDepth::Levels(2));
    }

    #[test]
    fn depth_zero_means_unlimited() {
        let q = SearchQuery::from_pairs([("depth", "0")]).unwrap();
        assert_eq!(q.depth, SearchDepth::Unlimited);
        assert!(q.to_pairs().is_empty());
    }

    #[test]
    fn bad_values_are_rejected() {
        for (key, value) in [("case", "maybe"), ("depth", "-1"), ("threads", "0"), ("size", "gt,10")] {
            let err = SearchQuery::from_pairs([(key, value)]).unwrap_err();
            assert!(matches!(err, VfsError::InvalidSearch(_)), "{key}={value}");
        }
        assert!(SearchQuery::from_pairs([("future_option", "x")]).is_ok());
    }

    #[test]
    fn size_clauses_bound_both_ways() {
        let clauses: Vec<SizeClause> = ["gt,10,kB", "lt,20,kB"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let accepts = |size: u64| clauses.iter().all(|c| c.accepts(&FileAttributes::file(size, 0o644)));
        assert!(accepts(15 * 1024));
        assert!(!accepts(25 * 1024));
        assert!(!accepts(10 * 1024));
        assert!(!clauses[1].accepts(&FileAttributes::directory(0o755)));
        assert_eq!(clauses[0].to_string(), "gt,10,kB");
        assert!("gt,1,TB".parse::<SizeClause>().is_err());
    }
}
