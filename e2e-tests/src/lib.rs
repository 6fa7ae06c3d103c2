//! Synthetic workers for exercising a running fleet
mod opts;
pub mod worker;

pub use self::opts::Opts;
