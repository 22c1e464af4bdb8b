//! Scriptable in-process engine for tests.
//!
//! [`MockConnector`] satisfies the [`Connector`] contract without a
//! network: every connect produces a [`MockEngine`] holding a plain
//! variable store. Connect failures, login requirements, and evaluation
//! failures can all be scripted, and every engine ever created stays
//! reachable through [`MockConnector::connections`] for inspection.
//!
//! The engine understands one expression form natively: a simple scalar
//! assignment `name <- <numeric literal>` (including `NaN`, `Inf` and
//! `-Inf`), which is how the script executor binds scalar inputs. Anything
//! else submitted via `void_eval` is handed to the connector's script
//! handler, a closure over the variable store installed by the test.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::endpoint::ServerEndpoint;
use crate::engine::{Connector, EngineConnection, RValue};
use crate::error::{Error, Result, ServerStatus};

/// Closure applied to non-assignment scripts: receives the script text and
/// the engine's variable store.
pub type ScriptHandler =
    Arc<dyn Fn(&str, &mut HashMap<String, RValue>) -> Result<()> + Send + Sync>;

#[derive(Default)]
struct ConnectorState {
    connections: Mutex<Vec<Arc<MockEngine>>>,
    connect_failures: AtomicUsize,
    connect_count: AtomicUsize,
    require_login: Mutex<Option<(String, String)>>,
    handler: Mutex<Option<ScriptHandler>>,
}

/// A [`Connector`] producing in-process engines.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<ConnectorState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require every new engine to authenticate with these credentials.
    pub fn require_login(self, username: &str, password: &str) -> Self {
        *self.state.require_login.lock().unwrap() =
            Some((username.to_string(), password.to_string()));
        self
    }

    /// Install a script handler applied to every engine created from now
    /// on.
    pub fn with_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&str, &mut HashMap<String, RValue>) -> Result<()> + Send + Sync + 'static,
    {
        *self.state.handler.lock().unwrap() = Some(Arc::new(handler));
        self
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.state.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Every engine created so far, in creation order.
    pub fn connections(&self) -> Vec<Arc<MockEngine>> {
        self.state.connections.lock().unwrap().clone()
    }

    /// Number of connection attempts, including failed ones.
    pub fn connect_count(&self) -> usize {
        self.state.connect_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &ServerEndpoint) -> Result<Arc<dyn EngineConnection>> {
        self.state.connect_count.fetch_add(1, Ordering::SeqCst);

        let failures = self.state.connect_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.state.connect_failures.store(failures - 1, Ordering::SeqCst);
            return Err(Error::Connect(format!("{}: scripted connect failure", endpoint)));
        }

        let engine = Arc::new(MockEngine {
            endpoint: endpoint.clone(),
            connected: AtomicBool::new(true),
            authenticated: AtomicBool::new(false),
            require_login: self.state.require_login.lock().unwrap().clone(),
            vars: Mutex::new(HashMap::new()),
            script_log: Mutex::new(Vec::new()),
            shutdown_count: AtomicUsize::new(0),
            handler: self.state.handler.lock().unwrap().clone(),
            fail_next: Mutex::new(None),
        });
        self.state.connections.lock().unwrap().push(engine.clone());
        Ok(engine)
    }
}

/// One in-process engine connection.
pub struct MockEngine {
    endpoint: ServerEndpoint,
    connected: AtomicBool,
    authenticated: AtomicBool,
    require_login: Option<(String, String)>,
    vars: Mutex<HashMap<String, RValue>>,
    script_log: Mutex<Vec<String>>,
    shutdown_count: AtomicUsize,
    handler: Option<ScriptHandler>,
    fail_next: Mutex<Option<Error>>,
}

impl MockEngine {
    /// The endpoint this engine was connected for.
    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    /// Seed a variable directly.
    pub fn set_var(&self, name: &str, value: RValue) {
        self.vars.lock().unwrap().insert(name.to_string(), value);
    }

    /// Read a variable back, if present.
    pub fn var(&self, name: &str) -> Option<RValue> {
        self.vars.lock().unwrap().get(name).cloned()
    }

    /// Every script submitted via `void_eval`, in order.
    pub fn script_log(&self) -> Vec<String> {
        self.script_log.lock().unwrap().clone()
    }

    /// How many times the server was asked to shut down.
    pub fn shutdown_count(&self) -> usize {
        self.shutdown_count.load(Ordering::SeqCst)
    }

    /// Fail the next eval or void_eval with this error.
    pub fn fail_next(&self, error: Error) {
        *self.fail_next.lock().unwrap() = Some(error);
    }

    /// Simulate the transport dropping out from under the client.
    pub fn drop_transport(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn ensure_ready(&self) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::ErrorKind::NotConnected));
        }
        if self.needs_login() {
            return Err(Error::Server(ServerStatus::AuthFailed));
        }
        Ok(())
    }

    fn take_scripted_failure(&self) -> Option<Error> {
        let error = self.fail_next.lock().unwrap().take();
        if let Some(e) = &error {
            if e.is_transport() {
                self.connected.store(false, Ordering::SeqCst);
            }
        }
        error
    }
}

// `base <- 2.5` style scalar assignments, the form the executor emits for
// scalar inputs. Anything more complex falls through to the handler.
fn parse_scalar_assignment(expr: &str) -> Option<(String, f64)> {
    let (name, rhs) = expr.split_once("<-")?;
    let name = name.trim();
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
    {
        return None;
    }
    let value = match rhs.trim() {
        "NaN" => f64::NAN,
        "Inf" => f64::INFINITY,
        "-Inf" => f64::NEG_INFINITY,
        literal => literal.parse().ok()?,
    };
    Some((name.to_string(), value))
}

#[async_trait]
impl EngineConnection for MockEngine {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn needs_login(&self) -> bool {
        self.require_login.is_some() && !self.authenticated.load(Ordering::SeqCst)
    }

    async fn login(&self, username: &str, password: &str) -> Result<()> {
        match &self.require_login {
            Some((user, password_expected))
                if user == username && password_expected == password =>
            {
                self.authenticated.store(true, Ordering::SeqCst);
                Ok(())
            }
            Some(_) => Err(Error::Server(ServerStatus::AuthFailed)),
            None => Ok(()),
        }
    }

    async fn assign(&self, name: &str, value: &RValue) -> Result<()> {
        self.ensure_ready()?;
        self.vars
            .lock()
            .unwrap()
            .insert(name.to_string(), value.clone());
        Ok(())
    }

    async fn eval(&self, expr: &str) -> Result<RValue> {
        self.ensure_ready()?;
        if let Some(error) = self.take_scripted_failure() {
            return Err(error);
        }
        self.vars
            .lock()
            .unwrap()
            .get(expr)
            .cloned()
            .ok_or_else(|| Error::Eval(format!("object '{}' not found", expr)))
    }

    async fn void_eval(&self, expr: &str) -> Result<()> {
        self.ensure_ready()?;
        if let Some(error) = self.take_scripted_failure() {
            return Err(error);
        }
        self.script_log.lock().unwrap().push(expr.to_string());

        if let Some((name, value)) = parse_scalar_assignment(expr) {
            self.vars.lock().unwrap().insert(name, RValue::Num(value));
            return Ok(());
        }
        if let Some(handler) = &self.handler {
            let mut vars = self.vars.lock().unwrap();
            return handler(expr, &mut vars);
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdown_count.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
