pub mod approval;
pub mod conversation;
pub mod job;
pub mod message;
pub mod schedule;
