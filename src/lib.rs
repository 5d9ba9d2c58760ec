//! pglue: a PostgreSQL client speaking the v3 frontend/backend protocol.
//!
//! The crate talks to the server directly over TCP or Unix-domain sockets:
//! no libpq, text format throughout. It provides parameterized queries with
//! injection-safe fragment composition, an extended-query pipeline with a
//! per-connection prepared-statement cache, simple multi-statement queries,
//! chunked row streaming, `COPY` in both directions, nested transactions via
//! savepoints, `LISTEN`/`NOTIFY` channels that survive reconnects,
//! SCRAM-SHA-256 authentication, and a bounded connection pool.
//!
//! # Example
//!
//! ```no_run
//! use pglue::{Config, Wire, sql};
//!
//! # async fn example() -> pglue::Result<()> {
//! let wire = Wire::connect(Config::from_url("postgres://postgres@localhost/postgres")?).await?;
//!
//! let name = "alice";
//! let (rows, tag) = wire
//!     .query(&sql("SELECT id, name FROM users WHERE name = ").bind(name))
//!     .collect()
//!     .await?;
//! assert!(tag.starts_with("SELECT"));
//! for row in &rows {
//!     println!("{:?} -> {:?}", row.get("id"), row.get("name"));
//! }
//!
//! let tx = wire.begin().await?;
//! wire.query(&sql("INSERT INTO users (name) VALUES (").bind("bob").raw(")"))
//!     .execute()
//!     .await?;
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Concurrent queries on one [`Wire`] are pipelined: every exchange owns one
//! slot in the wire's write/read order and resynchronizes at a
//! `ReadyForQuery` boundary, so failures never leak into a neighbor's
//! responses.

pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod query;
pub mod sasl;
pub mod sql;
pub mod statement;
pub mod transaction;
pub mod types;

#[cfg(test)]
mod tests;

pub use config::Config;
pub use connection::{Channel, CopySink, CopySource, Notification, Wire, WireEvent};
pub use error::{Error, Result, ServerError};
pub use pool::{Pool, PoolGuard, PoolOptions, PoolTransaction};
pub use protocol::TransactionStatus;
pub use query::{Query, Row, RowStream};
pub use sql::{ident, param, quote_ident, sql, SqlFragment};
pub use transaction::Transaction;
pub use types::{Codec, Codecs, Oid, Value};
