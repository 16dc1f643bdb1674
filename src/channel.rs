//! Channel identifiers
//!
//! A channel is the routing key clients publish to and subscribe on. Its
//! textual form is `"<id>"` or `"<id>/<subtopic>/..."`, and it maps onto a
//! broker subject `channel.<id>[.<subtopic>...]` shared with the other
//! protocol adapters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AdapterError;

/// Prefix of every broker subject produced by this adapter
pub const SUBJECT_PREFIX: &str = "channel";

const MAX_ID_LEN: usize = 256;
const MAX_SUBTOPIC_SEGMENTS: usize = 32;

/// A validated, immutable channel identifier with an optional sub-topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Channel {
    id: String,
    subtopic: Vec<String>,
}

impl Channel {
    /// Parse `"<id>"` or `"<id>/<subtopic>..."`
    pub fn parse(raw: &str) -> Result<Self, AdapterError> {
        let raw = raw.trim_matches('/');
        let (id, rest) = match raw.split_once('/') {
            Some((id, rest)) => (id, Some(rest)),
            None => (raw, None),
        };
        Self::new(id, rest)
    }

    /// Build a channel from an id and an optional sub-topic path
    ///
    /// Sub-topic segments may be separated by `/` or `.`.
    pub fn new(id: &str, subtopic: Option<&str>) -> Result<Self, AdapterError> {
        validate_id(id)?;

        let subtopic = match subtopic {
            Some(s) if !s.is_empty() => parse_subtopic(s)?,
            _ => Vec::new(),
        };

        Ok(Self {
            id: id.to_string(),
            subtopic,
        })
    }

    /// Channel id checked against the authorization authority
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sub-topic in `a/b/c` form, if any
    pub fn subtopic(&self) -> Option<String> {
        if self.subtopic.is_empty() {
            None
        } else {
            Some(self.subtopic.join("/"))
        }
    }

    /// Whether the sub-topic contains `*` or `>`
    pub fn is_wildcard(&self) -> bool {
        self.subtopic.iter().any(|s| s == "*" || s == ">")
    }

    /// Broker subject for this channel
    pub fn subject(&self) -> String {
        let mut subject = format!("{}.{}", SUBJECT_PREFIX, self.id);
        for segment in &self.subtopic {
            subject.push('.');
            subject.push_str(segment);
        }
        subject
    }

    /// Reject wildcard channels on the publish path
    pub fn ensure_publishable(&self) -> Result<(), AdapterError> {
        if self.is_wildcard() {
            return Err(AdapterError::InvalidChannel(format!(
                "cannot publish to wildcard channel '{}'",
                self
            )));
        }
        Ok(())
    }
}

fn validate_id(id: &str) -> Result<(), AdapterError> {
    if id.is_empty() {
        return Err(AdapterError::InvalidChannel(
            "channel id must not be empty".to_string(),
        ));
    }
    if id.len() > MAX_ID_LEN {
        return Err(AdapterError::InvalidChannel(format!(
            "channel id longer than {} bytes",
            MAX_ID_LEN
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(AdapterError::InvalidChannel(format!(
            "channel id '{}' contains invalid characters",
            id
        )));
    }
    Ok(())
}

fn parse_subtopic(raw: &str) -> Result<Vec<String>, AdapterError> {
    let segments: Vec<&str> = raw.split(|c| c == '/' || c == '.').collect();

    if segments.len() > MAX_SUBTOPIC_SEGMENTS {
        return Err(AdapterError::InvalidChannel(format!(
            "subtopic has more than {} segments",
            MAX_SUBTOPIC_SEGMENTS
        )));
    }

    let last = segments.len() - 1;
    let mut parsed = Vec::with_capacity(segments.len());
    for (i, segment) in segments.iter().enumerate() {
        match *segment {
            "" => {
                return Err(AdapterError::InvalidChannel(format!(
                    "empty segment in subtopic '{}'",
                    raw
                )))
            }
            "*" => {}
            ">" if i == last => {}
            ">" => {
                return Err(AdapterError::InvalidChannel(
                    "'>' is only allowed as the last subtopic segment".to_string(),
                ))
            }
            s if s
                .chars()
                .any(|c| c.is_whitespace() || c == '*' || c == '>') =>
            {
                return Err(AdapterError::InvalidChannel(format!(
                    "subtopic segment '{}' contains invalid characters",
                    s
                )))
            }
            _ => {}
        }
        parsed.push(segment.to_string());
    }

    Ok(parsed)
}

/// NATS-style subject matching: `*` matches one token, `>` the remainder
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        for segment in &self.subtopic {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

impl FromStr for Channel {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::parse(s)
    }
}

impl TryFrom<String> for Channel {
    type Error = AdapterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Channel::parse(&value)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.to_string()
    }
}
