//! One TCP session to the tracking service.
//!
//! `Session::open` connects and immediately splits the stream so the receive
//! loop and the dispatcher can run concurrently without sharing a lock.

use super::protocol::{read_frame, write_frame};
use crate::config::{Endpoint, SessionConfig};
use crate::error::{ClientError, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// Opens sessions.
pub struct Session;

impl Session {
    /// Connect to `endpoint` and split the stream into its two halves.
    pub async fn open(endpoint: &Endpoint) -> Result<(SessionReader, SessionWriter)> {
        let target = endpoint.to_string();
        let stream = tokio::time::timeout(
            SessionConfig::CONNECT_TIMEOUT,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| ClientError::Connect {
            endpoint: target.clone(),
            message: format!("timed out after {:?}", SessionConfig::CONNECT_TIMEOUT),
        })?
        .map_err(|e| ClientError::Connect {
            endpoint: target.clone(),
            message: e.to_string(),
        })?;

        stream.set_nodelay(true)?;
        debug!("Session opened to {}", target);

        let (read, write) = stream.into_split();
        Ok((
            SessionReader { inner: read },
            SessionWriter {
                inner: Some(write),
                endpoint: target,
            },
        ))
    }
}

/// Receive half of a session.
pub struct SessionReader {
    inner: OwnedReadHalf,
}

impl SessionReader {
    /// Wait for the next frame. `Ok(None)` means the peer closed cleanly.
    pub async fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        read_frame(&mut self.inner).await
    }
}

/// Send half of a session.
pub struct SessionWriter {
    inner: Option<OwnedWriteHalf>,
    endpoint: String,
}

impl SessionWriter {
    /// Send one frame.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let writer = self
            .inner
            .as_mut()
            .ok_or_else(|| ClientError::ConnectionLost("session already closed".into()))?;
        write_frame(writer, payload)
            .await
            .map_err(|e| ClientError::ConnectionLost(format!("send failed: {}", e)))
    }

    /// Shut down the write direction. Calling it again is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.inner.take() {
            writer.shutdown().await?;
            debug!("Session to {} closed", self.endpoint);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}
