pub mod backend;
pub mod client;
pub mod error;

pub use backend::S3Backend;
pub use client::{RemoteObject, S3Client};
