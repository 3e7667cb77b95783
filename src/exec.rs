//! Command sessions inside running containers.
//!
//! An [`ExecSession`] is created in two steps against the runtime (create the
//! exec instance, then start and attach to it) and exposes the attached
//! channel: bytes written go to the command's stdin, bytes read are
//! demultiplexed from its stdout/stderr.

use crate::frame::{BufferedFrames, LiveFrames, StreamFilter};
use crate::runtime::{ContainerRuntime, ExecChannel, ExecOptions, Result, RuntimeError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// An attached command session.
pub struct ExecSession {
    exec_id: String,
    channel: Option<ExecChannel>,
    stream: bool,
}

impl ExecSession {
    /// Create and attach a command in `container`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Unavailable`] if the container is missing or
    /// not running, or any error raised while attaching.
    pub async fn open(
        runtime: &dyn ContainerRuntime,
        container: &str,
        cmd: &[String],
        options: ExecOptions,
    ) -> Result<Self> {
        let exec_id = runtime.create_exec(container, cmd, &options).await?;
        debug!("Created exec {} in container {}", exec_id, container);

        let channel = runtime.start_exec(&exec_id, &options).await?;

        Ok(Self::from_channel(exec_id, channel, options.stream))
    }

    /// Wrap an already attached channel.
    pub fn from_channel(exec_id: impl Into<String>, channel: ExecChannel, stream: bool) -> Self {
        Self {
            exec_id: exec_id.into(),
            channel: Some(channel),
            stream,
        }
    }

    /// The runtime's id for this command.
    pub fn id(&self) -> &str {
        &self.exec_id
    }

    /// Whether replies are read incrementally.
    pub fn is_streamed(&self) -> bool {
        self.stream
    }

    fn channel(&mut self) -> Result<&mut ExecChannel> {
        self.channel
            .as_mut()
            .ok_or_else(|| RuntimeError::Io(std::io::ErrorKind::NotConnected.into()))
    }

    /// Send bytes to the command's stdin.
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed or the write fails.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let channel = self.channel()?;
        channel.write_all(bytes).await?;
        channel.flush().await?;
        Ok(())
    }

    /// Read the whole reply, keeping the streams selected by `filter`.
    ///
    /// Buffered sessions read the channel to EOF before decoding; streamed
    /// sessions decode frame by frame and stop at the completion marker.
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed or a read fails.
    pub async fn read(&mut self, filter: StreamFilter) -> Result<Vec<u8>> {
        let stream = self.stream;
        let channel = self.channel()?;

        if stream {
            Ok(LiveFrames::new(channel, filter).read_to_end().await?)
        } else {
            let mut buf = Vec::new();
            channel.read_to_end(&mut buf).await?;
            Ok(BufferedFrames::new(&buf, filter).concat())
        }
    }

    /// Lazy sequence of reply chunks.
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed.
    pub fn chunks(&mut self, filter: StreamFilter) -> Result<LiveFrames<&mut ExecChannel>> {
        Ok(LiveFrames::new(self.channel()?, filter))
    }

    /// Close the write half so the command sees EOF on stdin.
    ///
    /// Does nothing once the session is closed.
    ///
    /// # Errors
    ///
    /// Returns error if the shutdown fails.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(channel) = self.channel.as_mut() {
            channel.shutdown().await?;
        }
        Ok(())
    }

    /// Release the channel. Safe to call more than once.
    pub fn close(&mut self) {
        if self.channel.take().is_some() {
            debug!("Closed exec session {}", self.exec_id);
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.channel.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{StreamType, encode_frame};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_write_then_streamed_read() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let mut session = ExecSession::from_channel("exec-1", Box::new(local), true);

        session.write(b"request\n").await.unwrap();

        let mut received = vec![0u8; 8];
        remote.read_exact(&mut received).await.unwrap();
        assert_eq!(received, b"request\n");

        let mut reply = Vec::new();
        encode_frame(StreamType::Stdout, b"{\"exitCode\":", &mut reply);
        encode_frame(StreamType::Stderr, b"warn", &mut reply);
        encode_frame(StreamType::Stdout, b"0}", &mut reply);
        remote.write_all(&reply).await.unwrap();
        drop(remote);

        let out = session.read(StreamFilter::new(true, false)).await.unwrap();
        assert_eq!(out, b"{\"exitCode\":0}");
    }

    #[tokio::test]
    async fn test_buffered_read_ignores_trailing_bytes() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let mut session = ExecSession::from_channel("exec-2", Box::new(local), false);

        let mut reply = Vec::new();
        encode_frame(StreamType::Stdout, b"done", &mut reply);
        reply.extend_from_slice(&[1, 0]);
        remote.write_all(&reply).await.unwrap();
        drop(remote);

        assert_eq!(session.read(StreamFilter::ALL).await.unwrap(), b"done");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (local, _remote) = tokio::io::duplex(64);
        let mut session = ExecSession::from_channel("exec-3", Box::new(local), true);

        session.close();
        session.close();
        assert!(session.is_closed());
        session.shutdown().await.unwrap();
        assert!(session.write(b"late").await.is_err());
    }
}
