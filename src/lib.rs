//! MySQL wire-protocol client building blocks: sessions, connection
//! pooling, load balancing across replicas, and race-free side-channel
//! query cancellation.
//!
//! The layers stack cleanly:
//! - [`protocol`] is the pure byte layer: length-encoded primitives, the
//!   packet framer with sequence validation, optional zlib compression,
//!   and the handshake/auth payload types.
//! - [`session`] drives one connection through connect, TLS, auth, and
//!   half-duplex command exchanges, with a per-session prepared-statement
//!   cache and a cancel ticket for killing a blocked exchange out of band.
//! - [`pool`] leases sessions from a bounded, semaphore-fair pool with
//!   idle recycling, liveness probing, and a background reaper;
//!   [`pool::PoolRegistry`] shares pools across call sites by normalized
//!   connect options.
//!
//! ```no_run
//! use hermod_mysql::config::{ConnectOptions, PoolOptions};
//! use hermod_mysql::pool::Pool;
//! use hermod_mysql::protocol::Command;
//! use hermod_mysql::session::command_payload;
//!
//! # async fn demo() -> Result<(), hermod_mysql::Error> {
//! let connect = ConnectOptions::new("db.example", "app").password("secret");
//! let pool = Pool::new(connect, PoolOptions::default().max_size(8));
//!
//! let mut session = pool.acquire().await?;
//! let reply = session
//!     .exchange(command_payload(Command::Query, b"SET autocommit = 1"))
//!     .await?;
//! session.release().await;
//! # Ok(())
//! # }
//! ```

pub mod balancer;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};
