// Followship index — prioritized follow edges between feeds, and the
// paginated follower lookup that drives fan-out.
//
// Followers are grouped into five priority tiers by fixed thresholds, so a
// follower's tier depends only on its own priority and never on who else
// is in the page. Each tier maps to a scheduling priority for the fan-out
// tasks that serve it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::db::models::Followship;
use crate::db::FeedStore;
use crate::error::FeedError;

/// Priority given to a followship created without one.
pub const DEFAULT_PRIORITY: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    Lowest,
    Low,
    Normal,
    High,
    Highest,
}

impl PriorityTier {
    /// Job-queue priority for fan-out tasks serving this tier.
    pub fn job_priority(&self) -> i32 {
        match self {
            PriorityTier::Lowest => -20,
            PriorityTier::Low => -10,
            PriorityTier::Normal => 0,
            PriorityTier::High => 10,
            PriorityTier::Highest => 20,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityTier::Lowest => "lowest",
            PriorityTier::Low => "low",
            PriorityTier::Normal => "normal",
            PriorityTier::High => "high",
            PriorityTier::Highest => "highest",
        }
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tier boundaries: `p <= lowest` is lowest, then `< low`, `< normal`,
/// `< high`, and everything above is highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierThresholds {
    pub lowest: i32,
    pub low: i32,
    pub normal: i32,
    pub high: i32,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            lowest: 0,
            low: 20,
            normal: 50,
            high: 80,
        }
    }
}

impl TierThresholds {
    pub fn new(lowest: i32, low: i32, normal: i32, high: i32) -> Result<Self, FeedError> {
        if !(lowest < low && low < normal && normal < high) {
            return Err(FeedError::Validation(format!(
                "tier thresholds must be strictly increasing, got {lowest},{low},{normal},{high}"
            )));
        }
        Ok(Self {
            lowest,
            low,
            normal,
            high,
        })
    }

    /// Parse "0,20,50,80".
    pub fn parse(s: &str) -> Result<Self, FeedError> {
        let values = s
            .split(',')
            .map(|part| part.trim().parse::<i32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| FeedError::Validation(format!("invalid tier thresholds '{s}': {e}")))?;
        match values.as_slice() {
            [lowest, low, normal, high] => Self::new(*lowest, *low, *normal, *high),
            _ => Err(FeedError::Validation(format!(
                "expected four tier thresholds, got '{s}'"
            ))),
        }
    }

    pub fn tier_of(&self, priority: i32) -> PriorityTier {
        if priority <= self.lowest {
            PriorityTier::Lowest
        } else if priority < self.low {
            PriorityTier::Low
        } else if priority < self.normal {
            PriorityTier::Normal
        } else if priority < self.high {
            PriorityTier::High
        } else {
            PriorityTier::Highest
        }
    }
}

/// One page of followers (or followees), grouped by tier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TieredFollowers {
    pub tiers: BTreeMap<PriorityTier, Vec<String>>,
    /// True when at least one more row exists past this page.
    pub has_more: bool,
}

impl TieredFollowers {
    pub fn is_empty(&self) -> bool {
        self.tiers.values().all(|feeds| feeds.is_empty())
    }

    pub fn len(&self) -> usize {
        self.tiers.values().map(|feeds| feeds.len()).sum()
    }

    /// Non-empty tiers, highest priority first.
    pub fn by_priority(&self) -> impl Iterator<Item = (PriorityTier, &Vec<String>)> {
        self.tiers
            .iter()
            .rev()
            .filter(|(_, feeds)| !feeds.is_empty())
            .map(|(tier, feeds)| (*tier, feeds))
    }
}

/// The paginated follower lookup the fan-out dispatcher depends on.
#[async_trait]
pub trait FollowerLookup: Send + Sync {
    async fn list_followers(
        &self,
        feed: &str,
        page_size: usize,
        offset: usize,
    ) -> Result<TieredFollowers>;
}

pub struct FollowshipIndex {
    store: Arc<dyn FeedStore>,
    thresholds: TierThresholds,
}

impl FollowshipIndex {
    pub fn new(store: Arc<dyn FeedStore>, thresholds: TierThresholds) -> Self {
        Self { store, thresholds }
    }

    pub fn thresholds(&self) -> &TierThresholds {
        &self.thresholds
    }

    pub async fn get(&self, follower: &str, followee: &str) -> Result<Option<Followship>> {
        self.store.get_followship(follower, followee).await
    }

    /// Create the edge. Returns false when it already existed.
    pub async fn add(&self, follower: &str, followee: &str, priority: Option<i32>) -> Result<bool> {
        let followship = Followship {
            follower: follower.to_string(),
            followee: followee.to_string(),
            priority: priority.unwrap_or(DEFAULT_PRIORITY),
            created_at: Utc::now(),
        };
        self.store.insert_followship(&followship).await
    }

    /// Delete the edge. Returns false when it did not exist.
    pub async fn remove(&self, follower: &str, followee: &str) -> Result<bool> {
        self.store.delete_followship(follower, followee).await
    }

    /// Feeds that `feed` follows, grouped by tier.
    pub async fn list_followees(
        &self,
        feed: &str,
        page_size: usize,
        offset: usize,
    ) -> Result<TieredFollowers> {
        let rows = self.store.followees_of(feed, page_size + 1, offset).await?;
        Ok(self.group(rows, page_size, |f| f.followee))
    }

    fn group(
        &self,
        mut rows: Vec<Followship>,
        page_size: usize,
        pick: impl Fn(Followship) -> String,
    ) -> TieredFollowers {
        let has_more = rows.len() > page_size;
        rows.truncate(page_size);
        let mut tiers: BTreeMap<PriorityTier, Vec<String>> = BTreeMap::new();
        for row in rows {
            let tier = self.thresholds.tier_of(row.priority);
            tiers.entry(tier).or_default().push(pick(row));
        }
        TieredFollowers { tiers, has_more }
    }
}

#[async_trait]
impl FollowerLookup for FollowshipIndex {
    /// Followers of `feed`, priority descending. One store query per call:
    /// it asks for one extra row to learn whether another page exists.
    async fn list_followers(
        &self,
        feed: &str,
        page_size: usize,
        offset: usize,
    ) -> Result<TieredFollowers> {
        let rows = self.store.followers_of(feed, page_size + 1, offset).await?;
        Ok(self.group(rows, page_size, |f| f.follower))
    }
}
