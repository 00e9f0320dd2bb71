pub mod executor;
pub mod queue;
pub mod reaper;
pub mod retry;
pub mod worker;
