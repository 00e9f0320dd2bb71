pub mod dlq;
pub mod job;
pub mod submission;
