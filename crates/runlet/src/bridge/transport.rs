//! Session transport: two unidirectional unix sockets.
//!
//! The manager is the server end. It binds both endpoints under a fresh
//! session directory before spawning the runner, then accepts the command
//! connection first and the response connection second. The runner connects
//! in the same order; both endpoint paths travel on its command line.

use std::io;
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use uuid::Uuid;

/// Endpoint paths handed to the runner on its command line.
#[derive(Debug, Clone)]
pub struct EndpointNames {
    pub command: PathBuf,
    pub response: PathBuf,
}

/// Manager-side listening pair.
///
/// Socket path format: `{temp_dir}/runlet-{token}/{command,response}.sock`
/// with an 8-hex-char random token, unique per spawn.
pub struct SessionListener {
    dir: PathBuf,
    command: UnixListener,
    response: UnixListener,
}

impl SessionListener {
    /// Bind both endpoints under a fresh session directory.
    pub fn bind() -> io::Result<(Self, EndpointNames)> {
        let token = short_token();
        let dir = std::env::temp_dir().join(format!("runlet-{token}"));
        std::fs::create_dir_all(&dir)?;

        let names = EndpointNames {
            command: dir.join("command.sock"),
            response: dir.join("response.sock"),
        };

        tracing::debug!(dir = %dir.display(), "Binding session endpoints");
        let command = bind_at(&names.command)?;
        let response = bind_at(&names.response)?;

        Ok((
            Self {
                dir,
                command,
                response,
            },
            names,
        ))
    }

    /// Accept the command connection. The runner connects command first.
    pub async fn accept_command(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.command.accept().await?;
        tracing::trace!("Command endpoint connected");
        Ok(stream)
    }

    /// Accept the response connection, after the command connection.
    pub async fn accept_response(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.response.accept().await?;
        tracing::trace!("Response endpoint connected");
        Ok(stream)
    }

    fn cleanup(&self) -> io::Result<()> {
        if self.dir.exists() {
            tracing::debug!(dir = %self.dir.display(), "Removing session directory");
            std::fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

impl Drop for SessionListener {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, "Failed to remove session directory");
        }
    }
}

fn bind_at(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path)
}

fn short_token() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Connect from the runner side, command first then response, matching the
/// manager's accept order.
pub async fn connect(names: &EndpointNames) -> io::Result<(UnixStream, UnixStream)> {
    tracing::trace!(command = %names.command.display(), "Connecting to command endpoint");
    let command = UnixStream::connect(&names.command).await?;
    tracing::trace!(response = %names.response.display(), "Connecting to response endpoint");
    let response = UnixStream::connect(&names.response).await?;
    Ok((command, response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::FrameCodec;
    use crate::bridge::protocol::Frame;
    use futures::{SinkExt, StreamExt};
    use rmpv::Value;
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[tokio::test]
    async fn session_pair_carries_frames_both_ways() {
        let (listener, names) = SessionListener::bind().unwrap();

        let runner = tokio::spawn(async move {
            let (command, response) = connect(&names).await.unwrap();
            let mut command_reader = FramedRead::new(command, FrameCodec::new());
            let mut response_writer = FramedWrite::new(response, FrameCodec::new());

            let frame = command_reader.next().await.unwrap().unwrap();
            match frame {
                Frame::Call { id, method, args } => {
                    assert_eq!(method, "add");
                    assert_eq!(args.len(), 2);
                    response_writer
                        .send(Frame::Response {
                            id,
                            outcome: crate::bridge::protocol::CallOutcome::Success(Some(
                                Value::from(8),
                            )),
                        })
                        .await
                        .unwrap();
                }
                other => panic!("unexpected frame {other:?}"),
            }
        });

        let command = listener.accept_command().await.unwrap();
        let response = listener.accept_response().await.unwrap();

        let mut command_writer = FramedWrite::new(command, FrameCodec::new());
        let mut response_reader = FramedRead::new(response, FrameCodec::new());

        command_writer
            .send(Frame::Call {
                id: 1,
                method: "add".to_string(),
                args: vec![Value::from(5), Value::from(3)],
            })
            .await
            .unwrap();

        match response_reader.next().await.unwrap().unwrap() {
            Frame::Response { id, outcome } => {
                assert_eq!(id, 1);
                assert_eq!(
                    outcome,
                    crate::bridge::protocol::CallOutcome::Success(Some(Value::from(8)))
                );
            }
            other => panic!("unexpected frame {other:?}"),
        }

        runner.await.unwrap();
    }

    #[test]
    fn tokens_are_short_and_unique_enough() {
        let a = short_token();
        let b = short_token();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }
}
