//! Remote-server driver.
//!
//! Connects, authenticates, validates, and shuts down individual backend
//! servers, and launches server processes for embedded entries. The
//! driver is stateless: every function takes the [`Connector`] and the
//! endpoint it operates on.
//!
//! Process launch works locally through a child process, or over `ssh`
//! when the endpoint host does not resolve to this machine. Child output
//! (stdout and stderr) is piped line-by-line into the log.

use backon::{ConstantBuilder, Retryable};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::constants::{STARTUP_PROBE_ATTEMPTS, STARTUP_PROBE_INTERVAL_MS};
use crate::endpoint::ServerEndpoint;
use crate::engine::{Connector, EngineConnection};
use crate::error::{Error, Result};

/// Open a connection to the endpoint, authenticating when the server
/// requires it.
///
/// # Errors
/// [`Error::Connect`] when the transport cannot be established, when the
/// server demands credentials the endpoint does not carry, or when
/// authentication is rejected.
pub async fn open(
    connector: &dyn Connector,
    endpoint: &ServerEndpoint,
) -> Result<Arc<dyn EngineConnection>> {
    let connection = connector.connect(endpoint).await?;

    if connection.needs_login() {
        match (endpoint.username(), endpoint.password()) {
            (Some(username), Some(password)) => {
                if let Err(e) = connection.login(username, password).await {
                    let _ = connection.close().await;
                    return Err(Error::Connect(format!(
                        "{}: authentication failed: {}",
                        endpoint, e
                    )));
                }
            }
            _ => {
                let _ = connection.close().await;
                return Err(Error::Connect(format!(
                    "{}: authentication required but no credentials configured",
                    endpoint
                )));
            }
        }
    }

    Ok(connection)
}

/// Probe the endpoint: open, check, close. Never fails; an unreachable or
/// unhealthy server is simply `false`.
pub async fn validate(connector: &dyn Connector, endpoint: &ServerEndpoint) -> bool {
    match open(connector, endpoint).await {
        Ok(connection) => {
            let up = connection.is_connected();
            let _ = connection.close().await;
            up
        }
        Err(e) => {
            tracing::debug!(endpoint = %endpoint, error = %e, "Validation probe failed");
            false
        }
    }
}

/// Send the server-side shutdown command to the endpoint over a temporary
/// connection.
pub async fn shutdown_server(connector: &dyn Connector, endpoint: &ServerEndpoint) -> Result<()> {
    tracing::info!(endpoint = %endpoint, "Sending shutdown command");
    let connection = open(connector, endpoint).await?;
    let result = connection.shutdown().await;
    let _ = connection.close().await;
    result?;
    tracing::info!(endpoint = %endpoint, "Shutdown command sent");
    Ok(())
}

/// Wait for a freshly spawned server to start answering, bounded by the
/// startup probe budget.
///
/// # Errors
/// [`Error::Connect`] when the server never comes up within the probe
/// window.
pub async fn wait_until_up(connector: &dyn Connector, endpoint: &ServerEndpoint) -> Result<()> {
    let probe = || async {
        if validate(connector, endpoint).await {
            Ok(())
        } else {
            Err(Error::Connect(format!(
                "{}: server is not answering",
                endpoint
            )))
        }
    };

    probe
        .retry(
            ConstantBuilder::default()
                .with_delay(Duration::from_millis(STARTUP_PROBE_INTERVAL_MS))
                .with_max_times(STARTUP_PROBE_ATTEMPTS),
        )
        .await
}

/// Whether the host names this machine.
///
/// Literal loopback names are accepted directly; anything else is
/// resolved and checked for a loopback address.
pub async fn is_local(host: &str) -> bool {
    if matches!(host, "localhost" | "127.0.0.1" | "::1") {
        return true;
    }
    match tokio::net::lookup_host((host, 0u16)).await {
        Ok(mut addrs) => addrs.any(|addr| addr.ip().is_loopback()),
        Err(_) => false,
    }
}

/// Launch a server process for the endpoint.
///
/// The command is run directly when the host is local, or wrapped in
/// `ssh <host> ...` otherwise, with `--RS-port <port>` appended either
/// way. Stdout and stderr are piped into the log. The returned handle
/// resolves to the process exit code.
///
/// # Errors
/// [`Error::InvalidArgument`] for a blank command; [`Error::Io`] when the
/// process cannot be spawned.
pub async fn startup(
    endpoint: &ServerEndpoint,
    command: &str,
) -> Result<JoinHandle<Result<i32>>> {
    if command.trim().is_empty() {
        return Err(Error::InvalidArgument("command must not be blank".to_string()));
    }

    let mut args: Vec<String> = Vec::new();
    if !is_local(endpoint.host()).await {
        args.push("ssh".to_string());
        args.push(endpoint.host().to_string());
    }
    args.extend(command.split_whitespace().map(str::to_string));
    args.push("--RS-port".to_string());
    args.push(endpoint.port().to_string());

    tracing::info!(endpoint = %endpoint, command = ?args, "Launching server process");

    let mut child = Command::new(&args[0])
        .args(&args[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let label = endpoint.to_string();
    if let Some(stdout) = child.stdout.take() {
        let label = label.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(server = %label, "{}", line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let label = label.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(server = %label, "{}", line);
            }
        });
    }

    Ok(tokio::spawn(async move {
        let status = child.wait().await?;
        let code = status.code().unwrap_or(-1);
        tracing::info!(server = %label, code, "Server process terminated");
        Ok(code)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockConnector;

    fn endpoint() -> ServerEndpoint {
        ServerEndpoint::new("localhost").unwrap()
    }

    #[tokio::test]
    async fn test_open_without_auth() {
        let connector = MockConnector::new();
        let connection = open(&connector, &endpoint()).await.unwrap();
        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn test_open_logs_in_when_required() {
        let connector = MockConnector::new().require_login("analyst", "secret");
        let authed = endpoint().with_credentials("analyst", "secret");

        let connection = open(&connector, &authed).await.unwrap();
        assert!(!connection.needs_login());
    }

    #[tokio::test]
    async fn test_open_fails_without_credentials() {
        let connector = MockConnector::new().require_login("analyst", "secret");

        let err = open(&connector, &endpoint()).await.unwrap_err();
        assert!(matches!(err, Error::Connect(_)));
        // The half-open connection was closed again.
        assert!(!connector.connections()[0].is_connected());
    }

    #[tokio::test]
    async fn test_open_fails_with_wrong_credentials() {
        let connector = MockConnector::new().require_login("analyst", "secret");
        let wrong = endpoint().with_credentials("analyst", "nope");

        let err = open(&connector, &wrong).await.unwrap_err();
        assert!(matches!(err, Error::Connect(_)));
    }

    #[tokio::test]
    async fn test_validate_up_and_down() {
        let connector = MockConnector::new();
        assert!(validate(&connector, &endpoint()).await);

        connector.fail_next_connects(1);
        assert!(!validate(&connector, &endpoint()).await);
    }

    #[tokio::test]
    async fn test_shutdown_server() {
        let connector = MockConnector::new();
        shutdown_server(&connector, &endpoint()).await.unwrap();
        assert_eq!(connector.connections()[0].shutdown_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_server_unreachable() {
        let connector = MockConnector::new();
        connector.fail_next_connects(1);
        let err = shutdown_server(&connector, &endpoint()).await.unwrap_err();
        assert!(matches!(err, Error::Connect(_)));
    }

    #[tokio::test]
    async fn test_wait_until_up_retries_through_failures() {
        let connector = MockConnector::new();
        connector.fail_next_connects(2);

        wait_until_up(&connector, &endpoint()).await.unwrap();
        // Two failed probes plus the successful one.
        assert!(connector.connect_count() >= 3);
    }

    #[tokio::test]
    async fn test_is_local_literals() {
        assert!(is_local("localhost").await);
        assert!(is_local("127.0.0.1").await);
        assert!(is_local("::1").await);
    }

    #[tokio::test]
    async fn test_is_local_unresolvable_host() {
        assert!(!is_local("no-such-host.invalid").await);
    }

    #[tokio::test]
    async fn test_startup_blank_command_rejected() {
        let err = startup(&endpoint(), "  ").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_startup_runs_local_process() {
        // `echo` exits immediately; the port flag just becomes output.
        let handle = startup(&endpoint(), "echo starting").await.unwrap();
        let code = handle.await.unwrap().unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_startup_missing_executable() {
        let err = startup(&endpoint(), "reservoir-no-such-executable")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
