pub mod availability;
pub mod booking;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod payment;
pub mod store;
pub mod wal;

pub use error::{Error, Result};
