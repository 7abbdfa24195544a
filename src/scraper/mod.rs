pub mod block_detection;
pub mod engine;
pub mod fetcher;
pub mod rate_limiter;
pub mod retry;
pub mod robots;
pub mod sanitize;
pub mod strategies;
pub mod user_agent;
pub mod validators;
