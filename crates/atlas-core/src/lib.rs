//! Core domain model for the Paper Atlas window store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "atlas-core";

/// Textual form used for `published_date` in the persisted table.
pub const PUBLISHED_DATE_FORMAT: &str = "%Y-%m-%d";

/// Provider record as returned by a fetch, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Permanent record URI, e.g. `http://arxiv.org/abs/2401.01234v1`.
    pub entry_uri: String,
    pub title: String,
    pub summary: String,
    pub primary_link: Option<String>,
    pub pdf_link: Option<String>,
    pub authors: Vec<String>,
    pub published: Option<DateTime<Utc>>,
}

/// Coarse two-valued significance signal used for downstream filtering and coloring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Reputation {
    #[default]
    Standard,
    Enhanced,
}

impl Reputation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reputation::Standard => "Standard",
            Reputation::Enhanced => "Enhanced",
        }
    }
}

impl fmt::Display for Reputation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownReputation(pub String);

impl fmt::Display for UnknownReputation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown reputation value {:?}", self.0)
    }
}

impl std::error::Error for UnknownReputation {}

impl FromStr for Reputation {
    type Err = UnknownReputation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            v if v.eq_ignore_ascii_case("standard") => Ok(Reputation::Standard),
            v if v.eq_ignore_ascii_case("enhanced") => Ok(Reputation::Enhanced),
            other => Err(UnknownReputation(other.to_string())),
        }
    }
}

/// Normalized record held by the window store and written to the persisted table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: String,
    pub title: String,
    pub abstract_text: String,
    /// Derived from `title` + `abstract_text`; never used for identity or scoring.
    pub embedding_text: String,
    pub source_url: String,
    pub published_date: NaiveDate,
    pub author_count: u32,
    pub reputation: Reputation,
}

impl CanonicalRecord {
    pub fn published_date_text(&self) -> String {
        self.published_date.format(PUBLISHED_DATE_FORMAT).to_string()
    }

    /// Title and abstract joined for keyword scoring.
    pub fn scoring_text(&self) -> String {
        format!("{} {}", self.title, self.abstract_text)
    }

    /// Rebuilds `embedding_text` from the current title/abstract and noise filter.
    pub fn rederive_embedding_text(&mut self, noise: &KeywordMatcher) {
        self.embedding_text = compose_embedding_text(&self.title, &self.abstract_text, noise);
    }
}

pub fn parse_published_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), PUBLISHED_DATE_FORMAT).ok()
}

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `"{title}. {abstract}"` with configured noise tokens removed.
pub fn compose_embedding_text(title: &str, abstract_text: &str, noise: &KeywordMatcher) -> String {
    let joined = format!("{}. {}", title.trim(), abstract_text.trim());
    let scrubbed = noise.strip(&joined);
    collapse_whitespace(&scrubbed)
}

/// Case-insensitive, whole-word matcher over a configured keyword list.
///
/// Keywords never match inside a longer word: `"mit"` matches `"MIT"` and
/// `"(MIT)"` but not `"submit"`. Boundaries are only asserted on the sides of a
/// keyword that start/end with a word character, so entries such as
/// `"github.com"` or `"C++"` behave as expected. Internal whitespace in a
/// keyword matches any whitespace run.
#[derive(Debug, Clone, Default)]
pub struct KeywordMatcher {
    pattern: Option<Regex>,
    keywords: Vec<String>,
}

impl KeywordMatcher {
    pub fn new<I, S>(keywords: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut keywords = keywords
            .into_iter()
            .map(|k| collapse_whitespace(k.as_ref()))
            .filter(|k| !k.is_empty())
            .collect::<Vec<_>>();
        keywords.sort_by(|a, b| {
            b.len()
                .cmp(&a.len())
                .then_with(|| a.to_lowercase().cmp(&b.to_lowercase()))
                .then_with(|| a.cmp(b))
        });
        keywords.dedup_by(|a, b| a.to_lowercase() == b.to_lowercase());

        if keywords.is_empty() {
            return Ok(Self::default());
        }

        let alternatives = keywords
            .iter()
            .map(|k| whole_word_pattern(k))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = RegexBuilder::new(&alternatives)
            .case_insensitive(true)
            .build()?;

        Ok(Self {
            pattern: Some(pattern),
            keywords,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.pattern.is_none()
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.pattern.as_ref().is_some_and(|re| re.is_match(text))
    }

    /// Removes every whole-word occurrence of a keyword.
    pub fn strip(&self, text: &str) -> String {
        match &self.pattern {
            Some(re) => re.replace_all(text, "").into_owned(),
            None => text.to_string(),
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn whole_word_pattern(keyword: &str) -> String {
    let body = keyword
        .split_whitespace()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\s+");
    let lead = if keyword.chars().next().is_some_and(is_word_char) {
        r"\b"
    } else {
        ""
    };
    let trail = if keyword.chars().last().is_some_and(is_word_char) {
        r"\b"
    } else {
        ""
    };
    format!("(?:{lead}{body}{trail})")
}
