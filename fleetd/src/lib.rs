#![deny(clippy::as_conversions)]

mod node;
pub mod retry;
pub mod stats;
pub mod store;
mod task;
mod wire;

pub use node::*;
