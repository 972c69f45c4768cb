pub mod budget;
pub mod build;
pub mod error;
pub mod message;
pub mod pipeline;
