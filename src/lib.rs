pub mod assignment;
pub mod config;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod feed;
pub mod ids;
pub mod messaging;
pub mod models;
pub mod queue;
pub mod requests;
pub mod retry;
pub mod routes;
pub mod stand;
pub mod store;

pub use error::{StandError, StandResult, StoreError};
pub use stand::Stand;
