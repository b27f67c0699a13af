//! Topic algebra: sorted, deduplicated tag sets, their canonical string form,
//! and the containment relation used by subscription relevance filtering.

use crate::error::TopicError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

/// Shared, process-wide compiled tag matcher. Built once at first use and
/// never rebuilt — the node constructs a reference to it at startup and
/// holds it for the process lifetime.
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_]+$").unwrap());

/// A non-empty, sorted, deduplicated set of tags.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Topic {
    tags: Vec<String>,
}

impl Topic {
    /// Build a Topic from an iterator of tags, sorting and deduplicating.
    /// Rejects an empty result and any tag failing the tag regex.
    pub fn new(tags: impl IntoIterator<Item = String>) -> Result<Self, TopicError> {
        let mut tags: Vec<String> = tags.into_iter().collect();
        for tag in &tags {
            if !TAG_RE.is_match(tag) {
                return Err(TopicError::InvalidTag(tag.clone()));
            }
        }
        tags.sort();
        tags.dedup();
        if tags.is_empty() {
            return Err(TopicError::Empty);
        }
        Ok(Self { tags })
    }

    /// Parse from a comma-separated string. Whitespace around commas is
    /// ignored; duplicate tags are silently dropped (a warning is the
    /// caller's responsibility to log).
    pub fn parse(s: &str) -> Result<Self, TopicError> {
        let tags = s
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        Self::new(tags)
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Canonical string form: tags joined by ", " in sorted order.
    pub fn to_canonical_string(&self) -> String {
        self.tags.join(", ")
    }

    /// `contains(self, other)` iff every tag of `self` is also a tag of
    /// `other` — `self` is broader, `other` narrower.
    pub fn contains(&self, other: &Topic) -> bool {
        self.tags.iter().all(|tag| other.tags.binary_search(tag).is_ok())
    }

    /// Visit tags in canonical (sorted) order.
    pub fn foreach<F: FnMut(&str)>(&self, mut f: F) {
        for tag in &self.tags {
            f(tag);
        }
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

/// An ordered list of topics a user subscribes to, read from a per-user text
/// file, one topic per line. Duplicates are rejected; an empty list is
/// never valid subscriptions for login purposes.
#[derive(Clone, Debug, Default)]
pub struct Subscriptions {
    topics: Vec<Topic>,
}

impl Subscriptions {
    pub fn new(topics: Vec<Topic>) -> Result<Self, TopicError> {
        for (i, a) in topics.iter().enumerate() {
            for b in &topics[i + 1..] {
                if a == b {
                    return Err(TopicError::InvalidTag(a.to_canonical_string()));
                }
            }
        }
        Ok(Self { topics })
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    /// `is_relevant(subs, msg_topic) := ∃ t ∈ subs . contains(t, msg_topic)`.
    pub fn is_relevant(&self, msg_topic: &Topic) -> bool {
        self.topics.iter().any(|t| t.contains(msg_topic))
    }

    /// Parse the HELLO wire form: topics separated by `;`, each topic a
    /// comma-joined tag list.
    pub fn parse_hello_string(s: &str) -> Result<Self, TopicError> {
        let topics = s
            .split(';')
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(Topic::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(topics)
    }

    pub fn to_hello_string(&self) -> String {
        self.topics
            .iter()
            .map(|t| t.to_canonical_string())
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Parse a subscriptions file: one topic per line, blank lines ignored.
    pub fn parse_file(contents: &str) -> Result<Self, TopicError> {
        let topics = contents
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .map(Topic::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(topics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> Topic {
        Topic::parse(s).unwrap()
    }

    #[test]
    fn parse_sorts_and_dedupes() {
        let topic = t("cats, apples, cats, bananas");
        assert_eq!(topic.to_canonical_string(), "apples, bananas, cats");
    }

    #[test]
    fn parse_rejects_empty() {
        assert!(Topic::parse("").is_err());
        assert!(Topic::parse("   ").is_err());
    }

    #[test]
    fn parse_rejects_invalid_tag() {
        assert!(Topic::parse("good, bad tag").is_err());
    }

    #[test]
    fn canonical_string_roundtrips() {
        let topic = t("zebra, apple, mango");
        let reparsed = Topic::parse(&topic.to_canonical_string()).unwrap();
        assert_eq!(topic, reparsed);
    }

    #[test]
    fn contains_is_reflexive() {
        let a = t("food, recipes");
        assert!(a.contains(&a));
    }

    #[test]
    fn contains_transitive() {
        let a = t("food");
        let b = t("food, recipes");
        let c = t("food, recipes, indian");
        assert!(a.contains(&b));
        assert!(b.contains(&c));
        assert!(a.contains(&c));
    }

    #[test]
    fn contains_broader_narrower_semantics() {
        // S2 from the end-to-end scenarios.
        let sub_hobby = t("hobby");
        let sub_food = t("food, recipes");

        assert!(sub_hobby.contains(&t("hobby, biking")));
        assert!(!sub_food.contains(&t("food")));
        assert!(sub_food.contains(&t("food, recipes")));
        assert!(sub_food.contains(&t("food, recipes, indian")));
    }

    #[test]
    fn subscriptions_hello_string_roundtrip() {
        let subs = Subscriptions::new(vec![t("a, b"), t("c")]).unwrap();
        let s = subs.to_hello_string();
        let reparsed = Subscriptions::parse_hello_string(&s).unwrap();
        assert_eq!(reparsed.topics(), subs.topics());
    }

    #[test]
    fn subscriptions_rejects_duplicates() {
        assert!(Subscriptions::new(vec![t("a"), t("a")]).is_err());
    }

    #[test]
    fn subscriptions_file_parses_one_per_line() {
        let subs = Subscriptions::parse_file("chat, cats\nfood\n\n").unwrap();
        assert_eq!(subs.topics().len(), 2);
    }
}
