//! Database layer - connection pooling, acquisition, table metadata, and migrations

pub mod acquire;
pub mod migrate;
pub mod pool;
pub mod schema;

pub use acquire::{PgConnector, acquire};
pub use migrate::Migrations;
pub use pool::Pool;
pub use schema::{TableTarget, query_table_target};
