//! The contract with the remote compute engine.
//!
//! The pool and the script executor never speak the wire protocol
//! themselves; they drive an [`EngineConnection`] obtained from a
//! [`Connector`]. The traits name exactly the operations the lower-level
//! client library must provide: connect, optional login, typed assignment,
//! expression evaluation, server shutdown, and connection close.
//!
//! Two implementations ship with the crate:
//!
//! - [`qap::QapConnector`]: a minimal QAP1 client for live Rserve servers
//! - [`mock::MockConnector`]: a scriptable in-process engine for tests
//!
//! Values crossing the boundary are modeled by [`RValue`], covering the
//! four types the script layer recognizes: strings, string vectors,
//! numeric scalars, and numeric vectors.

use std::sync::Arc;

use async_trait::async_trait;

use crate::endpoint::ServerEndpoint;
use crate::error::{Error, Result};

pub mod codec;
pub mod mock;
pub mod qap;

/// The type of a value bound into or read back from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RDataType {
    /// A single character string.
    Str,
    /// A character vector.
    Strings,
    /// A numeric scalar.
    Num,
    /// A numeric vector.
    Nums,
}

impl RDataType {
    /// Human-readable name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            RDataType::Str => "string",
            RDataType::Strings => "string vector",
            RDataType::Num => "numeric",
            RDataType::Nums => "numeric vector",
        }
    }
}

/// A typed value exchanged with the remote engine.
///
/// Accessors are lenient the way the original client library was: a
/// one-element vector answers for a scalar and a scalar answers for a
/// one-element vector.
#[derive(Debug, Clone, PartialEq)]
pub enum RValue {
    Str(String),
    Strings(Vec<String>),
    Num(f64),
    Nums(Vec<f64>),
}

impl RValue {
    /// The type of this value.
    pub fn data_type(&self) -> RDataType {
        match self {
            RValue::Str(_) => RDataType::Str,
            RValue::Strings(_) => RDataType::Strings,
            RValue::Num(_) => RDataType::Num,
            RValue::Nums(_) => RDataType::Nums,
        }
    }

    /// The value as a numeric scalar. A numeric vector contributes its
    /// first element.
    pub fn as_num(&self) -> Option<f64> {
        match self {
            RValue::Num(n) => Some(*n),
            RValue::Nums(v) => v.first().copied(),
            _ => None,
        }
    }

    /// The value as a numeric vector. A scalar becomes a one-element
    /// vector.
    pub fn as_nums(&self) -> Option<Vec<f64>> {
        match self {
            RValue::Num(n) => Some(vec![*n]),
            RValue::Nums(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// The value as a string. A string vector contributes its first
    /// element.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RValue::Str(s) => Some(s),
            RValue::Strings(v) => v.first().map(|s| s.as_str()),
            _ => None,
        }
    }

    /// The value as a string vector. A single string becomes a one-element
    /// vector.
    pub fn as_strings(&self) -> Option<Vec<String>> {
        match self {
            RValue::Str(s) => Some(vec![s.clone()]),
            RValue::Strings(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Convert this value to the declared type, applying the lenient
    /// scalar/vector coercions.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] when no coercion applies.
    pub fn coerce(&self, ty: RDataType) -> Result<RValue> {
        let mismatch = || Error::TypeMismatch {
            expected: ty.name(),
            actual: self.data_type().name(),
        };
        match ty {
            RDataType::Str => self
                .as_str()
                .map(|s| RValue::Str(s.to_string()))
                .ok_or_else(mismatch),
            RDataType::Strings => self.as_strings().map(RValue::Strings).ok_or_else(mismatch),
            RDataType::Num => self.as_num().map(RValue::Num).ok_or_else(mismatch),
            RDataType::Nums => self.as_nums().map(RValue::Nums).ok_or_else(mismatch),
        }
    }

    /// Flatten a row-major table of numbers into a single numeric vector.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] for an empty table or ragged
    /// rows.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<RValue> {
        let first = rows
            .first()
            .ok_or_else(|| Error::InvalidArgument("table must not be empty".to_string()))?;
        let width = first.len();
        let mut flat = Vec::with_capacity(rows.len() * width);
        for row in rows {
            if row.len() != width {
                return Err(Error::InvalidArgument(format!(
                    "ragged table: row of length {} in a table of width {}",
                    row.len(),
                    width
                )));
            }
            flat.extend_from_slice(row);
        }
        Ok(RValue::Nums(flat))
    }
}

impl From<f64> for RValue {
    fn from(n: f64) -> Self {
        RValue::Num(n)
    }
}

impl From<&str> for RValue {
    fn from(s: &str) -> Self {
        RValue::Str(s.to_string())
    }
}

impl From<String> for RValue {
    fn from(s: String) -> Self {
        RValue::Str(s)
    }
}

impl From<Vec<String>> for RValue {
    fn from(v: Vec<String>) -> Self {
        RValue::Strings(v)
    }
}

impl From<&[&str]> for RValue {
    fn from(v: &[&str]) -> Self {
        RValue::Strings(v.iter().map(|s| s.to_string()).collect())
    }
}

impl From<Vec<f64>> for RValue {
    fn from(v: Vec<f64>) -> Self {
        RValue::Nums(v)
    }
}

impl From<&[f64]> for RValue {
    fn from(v: &[f64]) -> Self {
        RValue::Nums(v.to_vec())
    }
}

/// One open connection to a remote engine.
///
/// Implementations are shared handles: every method takes `&self` and the
/// implementation serializes access internally. The pool vends each handle
/// to at most one borrower at a time, so contention is not expected on the
/// hot path.
#[async_trait]
pub trait EngineConnection: Send + Sync {
    /// Whether the transport is believed to be up. This reflects the last
    /// observed state; it is not a probe.
    fn is_connected(&self) -> bool;

    /// Whether the server requires authentication before use.
    fn needs_login(&self) -> bool;

    /// Authenticate with the server.
    async fn login(&self, username: &str, password: &str) -> Result<()>;

    /// Bind a named value in the remote global environment.
    async fn assign(&self, name: &str, value: &RValue) -> Result<()>;

    /// Evaluate an expression and return its value.
    async fn eval(&self, expr: &str) -> Result<RValue>;

    /// Evaluate an expression, discarding the result.
    async fn void_eval(&self, expr: &str) -> Result<()>;

    /// Ask the server process to shut down.
    async fn shutdown(&self) -> Result<()>;

    /// Close the transport. Further operations fail.
    async fn close(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn EngineConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConnection")
            .field("is_connected", &self.is_connected())
            .field("needs_login", &self.needs_login())
            .finish()
    }
}

/// Opens connections to endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a transport to the endpoint. Authentication is not
    /// performed here; the driver logs in when the server asks for it.
    async fn connect(&self, endpoint: &ServerEndpoint) -> Result<Arc<dyn EngineConnection>>;
}
