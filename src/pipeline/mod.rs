// Write pipeline — routing writes to feeds, propagating them to followers,
// and the history work behind follow/unfollow.

pub mod fanout;
pub mod follow;
pub mod router;
pub mod trim;

pub use fanout::{apply_fanout, Dispatcher, FanoutOperation};
pub use follow::FollowOrchestrator;
pub use router::FeedRouter;
pub use trim::Trimmer;
