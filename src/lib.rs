pub mod cache;
pub mod config;
pub mod error;
pub mod infra;
pub mod replay;
pub mod warm;
