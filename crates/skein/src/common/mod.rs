pub mod cli;
pub mod data_structures;
pub mod error;
pub mod ids;
pub mod setup;
pub mod utils;
