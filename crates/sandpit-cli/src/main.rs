//! sandpit CLI - Command line client for the sandpit daemon

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sandpit_core::config::default_socket_path;
use sandpit_core::protocol::{Request, Response};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

mod client;

use client::Client;

#[derive(Parser)]
#[command(name = "sandpit")]
#[command(author, version, about = "Client for the per-session sandbox daemon")]
struct Cli {
    /// Socket path (defaults to SANDPIT_SOCKET env var or /run/sandpit/sandpit.sock)
    #[arg(short, long, global = true)]
    socket: Option<PathBuf>,

    /// Print the raw response as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start (or reuse) the sandbox for a session
    Start {
        /// Session identifier
        session: String,
    },

    /// Execute Python code in a session's sandbox
    Exec {
        /// Session identifier
        session: String,

        /// Code to execute (or - for stdin)
        #[arg(conflicts_with = "file")]
        code: Option<String>,

        /// Read the code from a file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Lint Python code in a session's sandbox
    Lint {
        /// Session identifier
        session: String,

        /// Code to check (or - for stdin)
        #[arg(conflicts_with = "file")]
        code: Option<String>,

        /// Read the code from a file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Stop and remove a session's sandbox
    Stop {
        /// Session identifier
        session: String,
    },

    /// Save local files as editor tabs inside the sandbox
    SaveTabs {
        /// Session identifier
        session: String,

        /// Files to upload; each tab is named after its file name
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Get daemon status
    Status,

    /// Ping the daemon
    Ping,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("sandpit=warn".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let socket = cli.socket.unwrap_or_else(default_socket_path);
    let request = build_request(cli.command)?;

    tracing::debug!(socket = ?socket, "connecting");
    let mut client = Client::connect(&socket).await?;
    let response = client.call(&request).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(exit_code(&response));
    }
    render(&response);
    Ok(exit_code(&response))
}

fn build_request(command: Commands) -> Result<Request> {
    Ok(match command {
        Commands::Start { session } => Request::Start { session },
        Commands::Exec {
            session,
            code,
            file,
        } => Request::Execute {
            session,
            code: read_code(code, file.as_deref())?,
        },
        Commands::Lint {
            session,
            code,
            file,
        } => Request::Lint {
            session,
            code: read_code(code, file.as_deref())?,
        },
        Commands::Stop { session } => Request::Stop { session },
        Commands::SaveTabs { session, files } => Request::SaveTabs {
            session,
            tabs: read_tabs(&files)?,
        },
        Commands::Status => Request::Status,
        Commands::Ping => Request::Ping,
    })
}

fn read_code(code: Option<String>, file: Option<&Path>) -> Result<String> {
    match (code, file) {
        (_, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display())),
        (Some(code), None) if code == "-" => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
        (Some(code), None) => Ok(code),
        (None, None) => anyhow::bail!("no code given; pass it inline, as -, or with --file"),
    }
}

fn read_tabs(files: &[PathBuf]) -> Result<BTreeMap<String, String>> {
    let mut tabs = BTreeMap::new();
    for path in files {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("{} has no usable file name", path.display()))?;
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        tabs.insert(name.to_owned(), contents);
    }
    Ok(tabs)
}

fn render(response: &Response) {
    match response {
        Response::Started => println!("started"),
        Response::Executed { html, text } => {
            if !text.is_empty() {
                println!("{text}");
            }
            if let Some(html) = html {
                println!("{html}");
            }
        }
        Response::Linted { report } if report.is_empty() => println!("no issues"),
        Response::Linted { report } => println!("{report}"),
        Response::Stopped => println!("stopped"),
        Response::TabsSaved => println!("tabs saved"),
        Response::Status { sessions } => println!("active sessions: {sessions}"),
        Response::Pong => println!("pong"),
        Response::Error { kind, message } => eprintln!("{kind}: {message}"),
    }
}

const fn exit_code(response: &Response) -> ExitCode {
    if is_failure(response) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

const fn is_failure(response: &Response) -> bool {
    matches!(response, Response::Error { .. })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_code_wins_without_file() {
        assert_eq!(read_code(Some("print(1)".into()), None).unwrap(), "print(1)");
        assert!(read_code(None, None).is_err());
    }

    #[test]
    fn tabs_are_named_after_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("helpers.py");
        std::fs::write(&path, "X = 1\n").unwrap();

        let tabs = read_tabs(&[path]).unwrap();
        assert_eq!(tabs, BTreeMap::from([("helpers.py".to_owned(), "X = 1\n".to_owned())]));
    }

    #[test]
    fn errors_fail_the_process() {
        assert!(!is_failure(&Response::Pong));
        let error = Response::Error {
            kind: sandpit_core::ErrorKind::SandboxNotFound,
            message: "gone".into(),
        };
        assert!(is_failure(&error));
    }
}
