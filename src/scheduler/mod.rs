pub mod batching;
pub mod jobs;
pub mod service;
pub mod triggers;
