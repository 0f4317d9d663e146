pub mod matcher;
pub mod processor;
pub mod schedule;
pub mod throttling;
pub mod worker;
