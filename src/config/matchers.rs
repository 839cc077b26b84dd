use std::fmt;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

/// A compiled regular expression that remembers the text it was built from.
#[derive(Clone)]
pub struct RegexRule {
    regex: Regex,
    source: String,
}

impl RegexRule {
    pub fn new(source: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(source)?,
            source: source.to_string(),
        })
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        self.regex.is_match(haystack)
    }

    pub fn is_match_bytes(&self, haystack: &[u8]) -> bool {
        // Bodies are not guaranteed to be UTF-8; match against a lossy view.
        self.regex.is_match(&String::from_utf8_lossy(haystack))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for RegexRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RegexRule").field(&self.source).finish()
    }
}

impl PartialEq for RegexRule {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for RegexRule {}

impl<'de> Deserialize<'de> for RegexRule {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let source = String::deserialize(deserializer)?;
        RegexRule::new(&source).map_err(de::Error::custom)
    }
}

impl Serialize for RegexRule {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.source)
    }
}

/// A regex applied to the values of one response header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMatch {
    pub header: String,

    pub regexp: RegexRule,

    /// When the header is absent, pass the rule instead of failing it.
    #[serde(default)]
    pub allow_missing: bool,
}
