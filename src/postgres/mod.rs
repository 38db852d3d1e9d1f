// ABOUTME: PostgreSQL adapters for the sync engine
// ABOUTME: Connection handling plus source/destination store implementations

pub mod connection;
pub mod store;

pub use connection::{connect, connect_with_retry, PgSession};
pub use store::{PgConnector, PgDestination, PgSource};
