// Feed identity and per-feed formatting rules.

pub mod id;
pub mod rank;
pub mod template;

pub use id::{is_placeholder, FeedId, FeedKind, FeedResolver};
pub use rank::RankSpec;
pub use template::format_aggregation;
