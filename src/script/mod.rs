//! Script execution against pooled connections.
//!
//! An [`RScript`] carries a script body plus named input and output
//! bindings. [`RScript::execute`] borrows one connection from the pool,
//! binds every input on the remote side, evaluates the body once in the
//! remote global environment, reads every declared output back, and
//! returns the connection — on every exit path.
//!
//! One executor is **not** safe for concurrent use; make one per worker.
//! The `&mut self` receiver enforces this at compile time.
//!
//! # Example
//!
//! ```rust,no_run
//! use reservoir::engine::RDataType;
//! use reservoir::pool::ConnectionPool;
//! use reservoir::script::RScript;
//!
//! # async fn run(pool: &ConnectionPool) -> reservoir::error::Result<()> {
//! let mut script = RScript::from_str("fit <- sum(values) / n");
//! script.set_input("values", vec![1.0, 2.0, 3.0])?;
//! script.set_input("n", 3.0)?;
//! script.set_output("fit", RDataType::Num)?;
//!
//! script.execute(pool).await?;
//! assert_eq!(script.output_num("fit"), Some(2.0));
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use crate::engine::{RDataType, RValue};
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, PooledConnection};

pub mod loader;

struct OutputBinding {
    data_type: RDataType,
    value: Option<RValue>,
}

/// A script with typed input and output bindings.
pub struct RScript {
    script: String,
    inputs: HashMap<String, RValue>,
    outputs: HashMap<String, OutputBinding>,
}

impl RScript {
    /// Build an executor around a script body held in a string.
    pub fn from_str(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
        }
    }

    /// Build an executor around a named script resource, located and
    /// cached by [`loader`].
    pub fn from_resource(name: &str) -> Result<Self> {
        Ok(Self::from_str(loader::load(name)?))
    }

    /// The script body this executor runs.
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Bind a named input. Overwrites any prior binding with the same
    /// name.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] for a blank name.
    pub fn set_input(&mut self, name: &str, value: impl Into<RValue>) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "input name must not be blank".to_string(),
            ));
        }
        self.inputs.insert(name.to_string(), value.into());
        Ok(())
    }

    /// Declare a named output to be read back as the given type after
    /// evaluation.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] for a blank name.
    pub fn set_output(&mut self, name: &str, data_type: RDataType) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "output name must not be blank".to_string(),
            ));
        }
        self.outputs.insert(
            name.to_string(),
            OutputBinding {
                data_type,
                value: None,
            },
        );
        Ok(())
    }

    /// The declared output names.
    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.keys().map(String::as_str).collect()
    }

    /// The declared type of an output, if declared.
    pub fn output_type(&self, name: &str) -> Option<RDataType> {
        self.outputs.get(name).map(|binding| binding.data_type)
    }

    /// The materialized value of an output, or `None` when the output was
    /// not declared or not yet materialized.
    pub fn output(&self, name: &str) -> Option<&RValue> {
        self.outputs.get(name).and_then(|binding| binding.value.as_ref())
    }

    /// A materialized numeric output.
    pub fn output_num(&self, name: &str) -> Option<f64> {
        self.output(name).and_then(RValue::as_num)
    }

    /// A materialized numeric-vector output.
    pub fn output_nums(&self, name: &str) -> Option<Vec<f64>> {
        self.output(name).and_then(RValue::as_nums)
    }

    /// A materialized string output.
    pub fn output_str(&self, name: &str) -> Option<&str> {
        self.output(name).and_then(RValue::as_str)
    }

    /// A materialized string-vector output.
    pub fn output_strings(&self, name: &str) -> Option<Vec<String>> {
        self.output(name).and_then(RValue::as_strings)
    }

    /// Run the script: acquire a connection, bind inputs, evaluate the
    /// body, materialize outputs, and hand the connection back.
    ///
    /// The connection is released on every path. A transport-level
    /// failure invalidates it instead — the connection is gone, not the
    /// script; a script-level failure releases it untouched.
    pub async fn execute(&mut self, pool: &ConnectionPool) -> Result<()> {
        let connection = pool.acquire().await?;

        let run_result = self.run(&connection).await;

        if let Err(e) = &run_result {
            tracing::error!(error = %e, script = %self.script, "Script execution failed");
            if e.is_transport() {
                if let Err(cleanup) = pool.invalidate(connection).await {
                    tracing::warn!(error = %cleanup, "Could not invalidate broken connection");
                }
                return run_result;
            }
        }

        let release_result = pool.release(connection);
        match run_result {
            Ok(()) => release_result,
            Err(e) => {
                if let Err(cleanup) = release_result {
                    tracing::warn!(error = %cleanup, "Could not return connection to the pool");
                }
                Err(e)
            }
        }
    }

    async fn run(&mut self, connection: &PooledConnection) -> Result<()> {
        for (name, value) in &self.inputs {
            match value {
                // The wire library has no typed assignment for a bare
                // scalar; it is bound as an assignment expression with an
                // R-syntax literal.
                RValue::Num(n) => {
                    let code = format!("{} <- {}", name, r_literal(*n));
                    tracing::debug!(input = %code, "Binding scalar input");
                    connection.void_eval(&code).await?;
                }
                other => {
                    tracing::debug!(input = %name, kind = other.data_type().name(), "Binding input");
                    connection.assign(name, other).await?;
                }
            }
        }

        connection.void_eval(&self.script).await?;

        for (name, binding) in self.outputs.iter_mut() {
            let value = connection.eval(name).await?;
            binding.value = Some(value.coerce(binding.data_type)?);
        }
        Ok(())
    }
}

// Format a double as an R literal; non-finite values use R's spelling,
// not Rust's.
fn r_literal(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n == f64::INFINITY {
        "Inf".to_string()
    } else if n == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        format!("{:?}", n)
    }
}
