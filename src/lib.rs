// feedmill: activity feed fan-out and aggregation engine
//
// This is the library root. Each module corresponds to a major part of the
// engine: feed identity, the per-kind feed handlers, the follow graph, the
// fan-out pipeline and the background job queue that drives it.

pub mod activity;
pub mod aggregation;
pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod followship;
pub mod handler;
pub mod jobs;
pub mod output;
pub mod pipeline;
pub mod service;
pub mod status;

pub use error::FeedError;
pub use service::FeedService;
