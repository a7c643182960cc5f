// Feed trimmer — probabilistically bounds a feed's length.
//
// Trimming on every write would put a delete on every hot path, so each
// mutation trims with probability `chance` instead. Feeds stay bounded in
// expectation; a feed can briefly hold more than maxLength items.

use anyhow::Result;
use tracing::debug;

use crate::db::models::Feed;
use crate::handler::FeedHandler;

#[derive(Debug, Clone, Copy)]
pub struct Trimmer {
    chance: f64,
}

impl Trimmer {
    /// `chance` is clamped to 0.0..=1.0.
    pub fn new(chance: f64) -> Self {
        Self {
            chance: chance.clamp(0.0, 1.0),
        }
    }

    /// A trimmer that trims after every mutation.
    pub fn always() -> Self {
        Self::new(1.0)
    }

    pub fn never() -> Self {
        Self::new(0.0)
    }

    pub fn chance(&self) -> f64 {
        self.chance
    }

    /// Roll the dice.
    pub fn should_trim(&self) -> bool {
        if self.chance >= 1.0 {
            true
        } else if self.chance <= 0.0 {
            false
        } else {
            rand::random::<f64>() < self.chance
        }
    }

    /// Trim `feed` to its maxLength if it has one and the roll says so.
    /// Returns the number of items removed, or None when no trim ran.
    pub async fn maybe_trim(&self, handler: &dyn FeedHandler, feed: &Feed) -> Result<Option<usize>> {
        let Some(max_len) = feed.max_length else {
            return Ok(None);
        };
        if !self.should_trim() {
            return Ok(None);
        }
        let removed = handler.trim(feed, max_len).await?;
        if removed > 0 {
            debug!(feed = %feed.id, max_len, removed, "trimmed feed");
        }
        Ok(Some(removed))
    }
}
