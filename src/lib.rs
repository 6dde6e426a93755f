// Metrics aggregation core: source decomposition, mergeable aggregates,
// routed persistence and topology queries.

pub mod collaborators;
pub mod config;
pub mod metrics;
pub mod pipeline;
pub mod retention;
pub mod source;
pub mod storage;
pub mod time_bucket;
pub mod topology;
