pub mod agent;
pub mod memory;
pub mod message;
pub mod workflow;
