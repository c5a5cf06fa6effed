//! Unix socket server

use sandpit_core::protocol::{self, Request, Response};
use sandpit_core::{ErrorKind, SandboxManager, SandpitError, SessionKey};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

/// Run the daemon server until `shutdown` flips to true
pub async fn run(
    listener: UnixListener,
    manager: Arc<SandboxManager>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let manager = Arc::clone(&manager);

                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, manager).await {
                        tracing::error!(error = %e, "connection error");
                    }
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Handle a single client connection
async fn handle_connection(
    mut stream: UnixStream,
    manager: Arc<SandboxManager>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    while let Some(frame) = protocol::read_frame(&mut stream).await? {
        let response = match protocol::decode::<Request>(&frame) {
            Ok(request) => {
                tracing::debug!(request = request_name(&request), "received request");
                handle_request(request, &manager).await
            }
            Err(e) => Response::Error {
                kind: ErrorKind::InvalidRequest,
                message: format!("malformed request: {e}"),
            },
        };

        let response_bytes = protocol::encode(&response)?;
        protocol::write_frame(&mut stream, &response_bytes).await?;
    }

    Ok(())
}

const fn request_name(request: &Request) -> &'static str {
    match request {
        Request::Start { .. } => "start",
        Request::Execute { .. } => "execute",
        Request::Lint { .. } => "lint",
        Request::Stop { .. } => "stop",
        Request::SaveTabs { .. } => "save_tabs",
        Request::Status => "status",
        Request::Ping => "ping",
    }
}

/// Handle a single request
pub async fn handle_request(request: Request, manager: &SandboxManager) -> Response {
    let result = match request {
        Request::Start { session } => match SessionKey::new(session) {
            Ok(key) => manager.start(&key).await.map(|()| Response::Started),
            Err(e) => Err(e),
        },
        Request::Execute { session, code } => match SessionKey::new(session) {
            Ok(key) => manager
                .execute(&key, &code)
                .await
                .map(|out| Response::Executed {
                    html: out.html,
                    text: out.text,
                }),
            Err(e) => Err(e),
        },
        Request::Lint { session, code } => match SessionKey::new(session) {
            Ok(key) => manager
                .lint(&key, &code)
                .await
                .map(|lint| Response::Linted {
                    report: lint.report,
                }),
            Err(e) => Err(e),
        },
        Request::Stop { session } => match SessionKey::new(session) {
            Ok(key) => manager.stop(&key).await.map(|()| Response::Stopped),
            Err(e) => Err(e),
        },
        Request::SaveTabs { session, tabs } => match SessionKey::new(session) {
            Ok(key) => manager
                .save_tabs(&key, &tabs)
                .await
                .map(|()| Response::TabsSaved),
            Err(e) => Err(e),
        },
        Request::Status => Ok(Response::Status {
            sessions: manager.active_sessions(),
        }),
        Request::Ping => Ok(Response::Pong),
    };

    result.unwrap_or_else(|e| {
        log_failure(&e);
        Response::from_error(&e)
    })
}

fn log_failure(error: &SandpitError) {
    match error.kind() {
        ErrorKind::Internal | ErrorKind::CreationFailure | ErrorKind::InjectionFailure => {
            tracing::warn!(kind = %error.kind(), error = %error, "request failed");
        }
        kind => tracing::debug!(%kind, "request rejected"),
    }
}
