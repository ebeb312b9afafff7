//! Copies the container's multiplexed output to the local process while the
//! orchestrator waits for a terminal state. Runs as its own task so the wait
//! never blocks on unconsumed output and the relay never blocks on the wait.

use bollard::container::LogOutput;
use bollard::errors::Error as DockerError;
use futures_util::{Stream, StreamExt};
use log::debug;
use tokio::io::AsyncWriteExt;

use crate::engine;
use crate::error::{Error, Result};

/// Pump the attach stream until it closes. A closed connection is the normal
/// end of the stream once the container has stopped, not a failure.
pub async fn pump<S>(mut output: S) -> Result<()>
where
    S: Stream<Item = std::result::Result<LogOutput, DockerError>> + Unpin,
{
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    while let Some(chunk) = output.next().await {
        match chunk {
            Ok(LogOutput::StdErr { message }) => {
                stderr
                    .write_all(&message)
                    .await
                    .map_err(|e| Error::io("write container stderr", e))?;
                let _ = stderr.flush().await;
            }
            Ok(LogOutput::StdOut { message })
            | Ok(LogOutput::Console { message })
            | Ok(LogOutput::StdIn { message }) => {
                stdout
                    .write_all(&message)
                    .await
                    .map_err(|e| Error::io("write container stdout", e))?;
                let _ = stdout.flush().await;
            }
            Err(e) if engine::is_connection_closed(&e) => {
                debug!("output stream closed: {e}");
                break;
            }
            Err(e) => return Err(Error::engine("read container output", e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[tokio::test]
    async fn connection_closed_ends_the_relay_cleanly() {
        let chunks: Vec<std::result::Result<LogOutput, DockerError>> = vec![
            Ok(LogOutput::StdOut {
                message: "starting core\n".into(),
            }),
            Err(DockerError::IOError {
                err: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed"),
            }),
        ];
        assert!(pump(stream::iter(chunks)).await.is_ok());
    }

    #[tokio::test]
    async fn real_stream_errors_propagate() {
        let chunks: Vec<std::result::Result<LogOutput, DockerError>> =
            vec![Err(DockerError::DockerResponseServerError {
                status_code: 500,
                message: "boom".into(),
            })];
        let err = pump(stream::iter(chunks)).await.unwrap_err();
        assert!(matches!(err, Error::Engine { .. }));
    }

    #[tokio::test]
    async fn empty_stream_is_a_clean_exit() {
        let chunks: Vec<std::result::Result<LogOutput, DockerError>> = vec![];
        assert!(pump(stream::iter(chunks)).await.is_ok());
    }
}
