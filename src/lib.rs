pub mod adapters;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod rpc;

pub use error::{Result, TransferError};
