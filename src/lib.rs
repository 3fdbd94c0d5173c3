pub mod config;
pub mod filter;
pub mod s3;
pub mod transfer;

pub use transfer::{TransferEngine, TransferError, TransferRequest};
