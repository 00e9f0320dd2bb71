//! Durable background job queue.
//!
//! Clients submit shell commands as jobs; any number of workers claim them
//! atomically from a shared SQLite store, run them with a timeout, retry
//! failures with exponential backoff plus jitter, and move jobs that exhaust
//! their retries to a dead-letter queue for inspection and manual replay.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod server;
pub mod services;

pub use config::{AppConfig, EngineSettings};
pub use models::job::{Job, JobState};
pub use services::queue::{JobQueue, QueueError};
pub use services::worker::{JobOutcome, Worker, WorkerPool};
