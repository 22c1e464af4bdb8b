//! # Reservoir
//! Pooled client for Rserve-compatible R compute servers.
//!
//! This crate maintains a fixed set of long-lived TCP connections to one
//! or more backend R servers, hands them out to application tasks on
//! demand with optional bounded wait, and reclaims them on return. A thin
//! companion layer runs user-authored R scripts over borrowed
//! connections: named inputs in, named outputs out.
//!
//! # Goals
//! - Safe concurrent sharing of a small set of expensive connections
//! - Strict return discipline: every borrow ends in a release or an
//!   invalidate, on every path
//! - Operational control of the backends themselves: launch, probe, and
//!   shut down Rserve processes
//!
//! ## Getting started
//! Install `reservoir` in your project with `cargo add reservoir` or add
//! it to your `Cargo.toml` dependencies:
//! ```toml
//! reservoir = "0.1"
//! ```
//!
//! ### Borrowing connections
//! [`ConnectionPool`](pool::ConnectionPool) is the main entry point.
//! Construct one explicitly from a [`PoolConfig`](config::PoolConfig), or
//! use the process-wide instance configured from `reservoir.toml`:
//!
//! ```rust,no_run
//! use reservoir::pool::ConnectionPool;
//!
//! #[tokio::main]
//! async fn main() -> reservoir::error::Result<()> {
//!     let pool = ConnectionPool::instance().await;
//!
//!     let conn = pool.acquire().await?;
//!     let version = conn.eval("R.version.string").await?;
//!     println!("{:?}", version);
//!     pool.release(conn)?;
//!     Ok(())
//! }
//! ```
//!
//! ### Running scripts
//! [`RScript`](script::RScript) binds typed inputs, evaluates a script
//! body once, and extracts typed outputs:
//!
//! ```rust,no_run
//! use reservoir::engine::RDataType;
//! use reservoir::pool::ConnectionPool;
//! use reservoir::script::RScript;
//!
//! #[tokio::main]
//! async fn main() -> reservoir::error::Result<()> {
//!     let pool = ConnectionPool::instance().await;
//!
//!     let mut script = RScript::from_str("m <- mean(samples)");
//!     script.set_input("samples", vec![1.0, 2.0, 4.0])?;
//!     script.set_output("m", RDataType::Num)?;
//!     script.execute(pool).await?;
//!
//!     println!("mean = {:?}", script.output_num("m"));
//!     Ok(())
//! }
//! ```
//!
//! The wire protocol is consumed through the
//! [`EngineConnection`](engine::EngineConnection) /
//! [`Connector`](engine::Connector) traits; a QAP1 client for live
//! servers and a scriptable in-process mock both ship with the crate.

#![forbid(unsafe_code)]

pub mod config;
pub mod constants;
pub mod driver;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod script;
pub mod telemetry;

pub mod prelude {
    //! Main exports for pool users.
    pub use crate::config::{PoolConfig, ServerConfig};
    pub use crate::endpoint::ServerEndpoint;
    pub use crate::engine::qap::QapConnector;
    pub use crate::engine::{Connector, EngineConnection, RDataType, RValue};
    pub use crate::error::{Error, Result, ServerStatus};
    pub use crate::pool::{ConnectionPool, PooledConnection};
    pub use crate::script::RScript;
}
