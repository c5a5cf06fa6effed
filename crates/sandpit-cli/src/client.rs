//! Daemon client over the framed msgpack protocol

use anyhow::{Context, Result, bail};
use sandpit_core::protocol::{self, Request, Response};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;

pub struct Client<S> {
    stream: S,
}

impl Client<UnixStream> {
    pub async fn connect(socket: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket)
            .await
            .with_context(|| format!("cannot connect to daemon at {}", socket.display()))?;
        Ok(Self::new(stream))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    pub const fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Send one request and wait for its response
    pub async fn call(&mut self, request: &Request) -> Result<Response> {
        let body = protocol::encode(request)?;
        protocol::write_frame(&mut self.stream, &body).await?;

        let Some(reply) = protocol::read_frame(&mut self.stream).await? else {
            bail!("daemon closed the connection");
        };
        Ok(protocol::decode(&reply)?)
    }
}
