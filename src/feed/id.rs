// Feed identity — parsing "<group>:<target>" and deciding which kind of
// feed the group names.
//
// The kind is derived purely from the group prefix: groups starting with the
// aggregated prefix are aggregated feeds, the notification prefix selects
// notification feeds, and every other group (user, timeline, document...)
// is a flat feed.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// Default reserved group prefixes.
pub const AGGREGATED_PREFIX: &str = "aggregated";
pub const NOTIFICATION_PREFIX: &str = "notification";

/// The three kinds of feed the engine knows how to store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    Flat,
    Aggregated,
    Notification,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::Flat => "flat",
            FeedKind::Aggregated => "aggregated",
            FeedKind::Notification => "notification",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "flat" => Some(FeedKind::Flat),
            "aggregated" => Some(FeedKind::Aggregated),
            "notification" => Some(FeedKind::Notification),
            _ => None,
        }
    }

    /// Only flat feeds can be followed.
    pub fn is_followable(&self) -> bool {
        matches!(self, FeedKind::Flat)
    }

    /// Aggregated and notification feeds store buckets instead of raw activities.
    pub fn is_aggregated(&self) -> bool {
        !matches!(self, FeedKind::Flat)
    }

    /// Aggregation template applied when the feed has none of its own.
    pub fn default_template(&self) -> &'static str {
        match self {
            FeedKind::Notification => "${verb}-${object}-${time}",
            _ => "${verb}-${time}",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A parsed feed identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedId {
    pub group: String,
    pub target: String,
}

impl FeedId {
    /// Split an identifier on its first ':'.
    pub fn parse(id: &str) -> Result<Self, FeedError> {
        let (group, target) = id
            .split_once(':')
            .ok_or_else(|| FeedError::InvalidFeedId(format!("'{id}' has no ':' separator")))?;
        if group.is_empty() {
            return Err(FeedError::InvalidFeedId(format!("'{id}' has an empty group")));
        }
        if target.is_empty() || is_placeholder(target) {
            return Err(FeedError::InvalidFeedId(format!(
                "'{id}' has an undefined target"
            )));
        }
        Ok(Self {
            group: group.to_string(),
            target: target.to_string(),
        })
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.target)
    }
}

/// True when a value still carries an unresolved interpolation: an
/// "undefined"/"null" segment (as in "user:undefined") or a "${" marker.
pub fn is_placeholder(value: &str) -> bool {
    value.contains("${")
        || value
            .split(':')
            .any(|segment| segment == "undefined" || segment == "null")
}

/// Maps group names to feed kinds using the configured reserved prefixes.
#[derive(Debug, Clone)]
pub struct FeedResolver {
    aggregated_prefix: String,
    notification_prefix: String,
}

impl Default for FeedResolver {
    fn default() -> Self {
        Self::new(AGGREGATED_PREFIX, NOTIFICATION_PREFIX)
    }
}

impl FeedResolver {
    pub fn new(aggregated_prefix: &str, notification_prefix: &str) -> Self {
        Self {
            aggregated_prefix: aggregated_prefix.to_string(),
            notification_prefix: notification_prefix.to_string(),
        }
    }

    pub fn kind_of(&self, group: &str) -> FeedKind {
        if group.starts_with(&self.aggregated_prefix) {
            FeedKind::Aggregated
        } else if group.starts_with(&self.notification_prefix) {
            FeedKind::Notification
        } else {
            FeedKind::Flat
        }
    }

    /// Parse an identifier and classify it in one step.
    pub fn resolve(&self, id: &str) -> Result<(FeedId, FeedKind), FeedError> {
        let feed_id = FeedId::parse(id)?;
        let kind = self.kind_of(&feed_id.group);
        Ok((feed_id, kind))
    }
}
