pub mod client;
pub mod common;
pub mod gateway;
pub mod job;
pub mod local;
pub mod master;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::SkeinError;
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::common::data_structures::{Map, Set};

// Priority: the cluster manager serves lower numbers first
pub type Priority = i32;

pub const SKEIN_VERSION: &str = env!("CARGO_PKG_VERSION");
