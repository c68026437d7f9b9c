//! Readiness detection for freshly spawned services.
//!
//! Exactly one check is consulted per invocation, picked from the definition:
//! a configured port wins over a configured pattern, and a definition with
//! neither is ready as soon as it has been spawned.

use std::time::Duration;

use regex::Regex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backoff::Backoff;
use crate::definition::ServiceDefinition;
use crate::error::{ProbeError, SupervisorError};

/// Upper bound for a single loopback connection attempt.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub enum ReadinessCheck {
    Immediate,
    Port(u16),
    Pattern(Regex),
}

impl ReadinessCheck {
    pub fn for_definition(definition: &ServiceDefinition) -> Result<Self, SupervisorError> {
        match (definition.port, &definition.ready_pattern) {
            (Some(port), _) => Ok(ReadinessCheck::Port(port)),
            (None, Some(pattern)) => Regex::new(pattern)
                .map(ReadinessCheck::Pattern)
                .map_err(|e| {
                    SupervisorError::Validation(format!(
                        "invalid readyPattern '{}': {}",
                        pattern, e
                    ))
                }),
            (None, None) => Ok(ReadinessCheck::Immediate),
        }
    }

    /// Whether the check consumes captured output lines.
    pub fn needs_output(&self) -> bool {
        matches!(self, ReadinessCheck::Pattern(_))
    }

    fn describe(&self) -> String {
        match self {
            ReadinessCheck::Immediate => "process spawn".to_owned(),
            ReadinessCheck::Port(port) => format!("port {}", port),
            ReadinessCheck::Pattern(regex) => format!("output matching '{}'", regex.as_str()),
        }
    }
}

pub struct ReadinessProbe {
    check: ReadinessCheck,
    timeout: Duration,
    backoff: Backoff,
}

impl ReadinessProbe {
    pub fn new(check: ReadinessCheck, timeout: Duration) -> Self {
        Self {
            check,
            timeout,
            backoff: Backoff::default(),
        }
    }

    /// Wait until the check is satisfied, the timeout elapses, or `cancel` fires.
    /// `output` carries the captured lines of both streams; it is only read in pattern mode.
    pub async fn wait(
        &self,
        output: &mut mpsc::UnboundedReceiver<String>,
        cancel: &CancellationToken,
    ) -> Result<(), ProbeError> {
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        if let ReadinessCheck::Immediate = self.check {
            return Ok(());
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(ProbeError::Cancelled),
            _ = tokio::time::sleep(self.timeout) => Err(ProbeError::Timeout {
                check: self.check.describe(),
            }),
            _ = self.satisfied(output) => Ok(()),
        }
    }

    async fn satisfied(&self, output: &mut mpsc::UnboundedReceiver<String>) {
        match &self.check {
            ReadinessCheck::Immediate => {}
            ReadinessCheck::Port(port) => {
                let mut attempt = 0;
                while !port_reachable(*port, ATTEMPT_TIMEOUT).await {
                    tokio::time::sleep(self.backoff.interval(attempt)).await;
                    attempt += 1;
                }
                debug!(port = *port, attempts = attempt + 1, "port became reachable");
            }
            ReadinessCheck::Pattern(regex) => {
                while let Some(line) = output.recv().await {
                    if regex.is_match(&line) {
                        debug!(pattern = regex.as_str(), "readiness pattern matched");
                        return;
                    }
                }
                // Both streams closed without a match; only the timeout can end this wait.
                std::future::pending::<()>().await
            }
        }
    }
}

/// Single time-boxed loopback connection attempt. Refused connections are not errors here.
pub async fn port_reachable(port: u16, attempt_timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(attempt_timeout, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}
