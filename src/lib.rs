pub mod config;
pub mod error;
pub mod fetch;
pub mod mapper;
pub mod output;
pub mod poller;
pub mod queries;
pub mod snapshot;
pub mod stats;
pub mod store;
pub mod sync;
pub mod upstream;

pub use error::{Error, Result};
