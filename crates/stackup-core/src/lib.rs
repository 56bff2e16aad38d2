pub mod apply;
pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod exec;
pub mod guard;
pub mod health;
pub mod paths;
pub mod pipeline;
pub mod poll;
pub mod readiness;
pub mod report;
pub mod tools;
pub mod tunnel;

#[cfg(test)]
mod testing;

pub use error::{Result, StackupError};
