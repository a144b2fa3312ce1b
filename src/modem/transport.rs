//! Framed AT command transport.
//!
//! The channel carries requests that each get exactly one final response
//! (with zero or more information lines before it), plus an independent
//! stream of unsolicited event lines with stable prefixes. Responses are
//! FIFO; at most one command is in flight at a time.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::connection::error::{DriverError, DriverErrorKind};

/// Transport failure.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The transport is gone.
    #[error("channel closed")]
    Closed,
    /// Writing the command failed.
    #[error("channel write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Final response plus the information lines that preceded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtResponse {
    /// Information lines matching the expected prefix.
    pub lines: Vec<String>,
    /// The final response line.
    pub final_line: String,
    /// Whether the final response was `OK`.
    pub ok: bool,
}

impl AtResponse {
    /// Map the final response onto a driver error, `Ok` when the
    /// command succeeded.
    pub fn check(&self) -> Result<(), DriverError> {
        if self.ok {
            return Ok(());
        }

        let parse_code = |prefix: &str| -> i32 {
            self.final_line
                .strip_prefix(prefix)
                .and_then(|rest| rest.trim().parse().ok())
                .unwrap_or(0)
        };

        if self.final_line.starts_with("+CME ERROR:") {
            return Err(DriverError {
                kind: DriverErrorKind::Cme,
                code: parse_code("+CME ERROR:"),
            });
        }

        if self.final_line.starts_with("+CMS ERROR:") {
            return Err(DriverError {
                kind: DriverErrorKind::Cms,
                code: parse_code("+CMS ERROR:"),
            });
        }

        Err(DriverError::failure())
    }
}

/// A framed command/response channel with unsolicited event routing.
#[async_trait]
pub trait AtChannel: Send + Sync {
    /// Send a command and wait for its final response. Information
    /// lines starting with `prefix` are collected into the response.
    async fn send(&self, command: &str, prefix: &str) -> Result<AtResponse, ChannelError>;

    /// Subscribe to unsolicited lines starting with `prefix`. The
    /// stream ends when the transport closes.
    fn subscribe(&self, prefix: &str) -> mpsc::UnboundedReceiver<String>;
}

fn is_final_line(line: &str) -> bool {
    matches!(line, "OK" | "ERROR" | "NO CARRIER")
        || line.starts_with("+CME ERROR:")
        || line.starts_with("+CMS ERROR:")
}

struct PendingCommand {
    prefix: String,
    lines: Vec<String>,
    done: oneshot::Sender<AtResponse>,
}

/// A poisoned lock only means some holder panicked mid-update; the
/// routing state itself stays usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct MuxShared {
    current: Mutex<Option<PendingCommand>>,
    subscribers: Mutex<Vec<(String, mpsc::UnboundedSender<String>)>>,
}

impl MuxShared {
    fn dispatch(&self, line: &str) {
        if is_final_line(line) {
            if let Some(pending) = lock(&self.current).take() {
                let response = AtResponse {
                    lines: pending.lines,
                    final_line: line.to_string(),
                    ok: line == "OK",
                };
                let _ = pending.done.send(response);
            }
            return;
        }

        // Response lines for the in-flight command win over unsolicited
        // handlers registered for the same prefix.
        {
            let mut current = lock(&self.current);
            if let Some(pending) = current.as_mut() {
                if !pending.prefix.is_empty() && line.starts_with(&pending.prefix) {
                    pending.lines.push(line.to_string());
                    return;
                }
            }
        }

        let mut routed = false;
        lock(&self.subscribers).retain(|(prefix, tx)| {
            if line.starts_with(prefix.as_str()) {
                routed = true;
                return tx.send(line.to_string()).is_ok();
            }
            !tx.is_closed()
        });

        if !routed {
            debug!(line, "unhandled modem line");
        }
    }

    fn close(&self) {
        // Dropping the senders ends every subscription stream; an
        // in-flight command fails through its dropped oneshot.
        lock(&self.subscribers).clear();
        lock(&self.current).take();
    }
}

/// Production [`AtChannel`] over any byte stream.
pub struct AtMux {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    command_lock: tokio::sync::Mutex<()>,
    shared: std::sync::Arc<MuxShared>,
}

impl AtMux {
    /// Split the stream and start the reader task.
    pub fn new<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let shared = std::sync::Arc::new(MuxShared::default());

        let reader_shared = shared.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if !line.is_empty() {
                            reader_shared.dispatch(line);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(%err, "modem transport read failed");
                        break;
                    }
                }
            }
            reader_shared.close();
        });

        Self {
            writer: tokio::sync::Mutex::new(Box::new(write_half)),
            command_lock: tokio::sync::Mutex::new(()),
            shared,
        }
    }
}

#[async_trait]
impl AtChannel for AtMux {
    async fn send(&self, command: &str, prefix: &str) -> Result<AtResponse, ChannelError> {
        let _serialized = self.command_lock.lock().await;

        let (done, response) = oneshot::channel();
        {
            let mut current = lock(&self.shared.current);
            *current = Some(PendingCommand {
                prefix: prefix.to_string(),
                lines: Vec::new(),
                done,
            });
        }

        {
            let mut writer = self.writer.lock().await;
            writer.write_all(command.as_bytes()).await?;
            writer.write_all(b"\r\n").await?;
            writer.flush().await?;
        }

        response.await.map_err(|_| ChannelError::Closed)
    }

    fn subscribe(&self, prefix: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.subscribers).push((prefix.to_string(), tx));
        rx
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    async fn write_lines(io: &mut tokio::io::DuplexStream, lines: &[&str]) {
        for line in lines {
            io.write_all(line.as_bytes()).await.unwrap();
            io.write_all(b"\r\n").await.unwrap();
        }
    }

    async fn read_command(io: &mut tokio::io::DuplexStream) -> String {
        let mut buf = [0u8; 256];
        let n = io.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).trim().to_string()
    }

    #[tokio::test]
    async fn collects_prefixed_lines_until_final() {
        let (mut modem, daemon) = tokio::io::duplex(1024);
        let mux = AtMux::new(daemon);

        let send = tokio::spawn(async move { mux.send("AT+CGACT?", "+CGACT:").await });

        assert_eq!(read_command(&mut modem).await, "AT+CGACT?");
        write_lines(&mut modem, &["+CGACT: 1,1", "+CGACT: 2,0", "OK"]).await;

        let response = send.await.unwrap().unwrap();
        assert!(response.ok);
        assert_eq!(response.lines, vec!["+CGACT: 1,1", "+CGACT: 2,0"]);
    }

    #[tokio::test]
    async fn routes_unsolicited_lines_during_command() {
        let (mut modem, daemon) = tokio::io::duplex(1024);
        let mux = AtMux::new(daemon);
        let mut cgev = mux.subscribe("+CGEV:");

        let send = tokio::spawn(async move { mux.send("AT+CGATT=1", "").await });

        assert_eq!(read_command(&mut modem).await, "AT+CGATT=1");
        write_lines(&mut modem, &["+CGEV: NW DETACH", "OK"]).await;

        assert!(send.await.unwrap().unwrap().ok);
        assert_eq!(cgev.recv().await.unwrap(), "+CGEV: NW DETACH");
    }

    #[tokio::test]
    async fn command_prefix_wins_over_subscription() {
        let (mut modem, daemon) = tokio::io::duplex(1024);
        let mux = std::sync::Arc::new(AtMux::new(daemon));
        let mut cgreg = mux.subscribe("+CGREG:");

        let mux_clone = mux.clone();
        let send = tokio::spawn(async move { mux_clone.send("AT+CGREG?", "+CGREG:").await });

        assert_eq!(read_command(&mut modem).await, "AT+CGREG?");
        write_lines(&mut modem, &["+CGREG: 2,1", "OK"]).await;

        let response = send.await.unwrap().unwrap();
        assert_eq!(response.lines, vec!["+CGREG: 2,1"]);

        // Outside a command the same prefix goes to the subscription.
        write_lines(&mut modem, &["+CGREG: 0"]).await;
        assert_eq!(cgreg.recv().await.unwrap(), "+CGREG: 0");
    }

    #[tokio::test]
    async fn cme_error_is_decoded() {
        let (mut modem, daemon) = tokio::io::duplex(1024);
        let mux = AtMux::new(daemon);

        let send = tokio::spawn(async move { mux.send("AT+CGATT=1", "").await });

        read_command(&mut modem).await;
        write_lines(&mut modem, &["+CME ERROR: 148"]).await;

        let response = send.await.unwrap().unwrap();
        assert!(!response.ok);
        let err = response.check().unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Cme);
        assert_eq!(err.code, 148);
    }

    #[tokio::test]
    async fn transport_loss_ends_subscriptions_and_commands() {
        let (modem, daemon) = tokio::io::duplex(1024);
        let mux = AtMux::new(daemon);
        let mut cgev = mux.subscribe("+CGEV:");

        drop(modem);

        assert!(cgev.recv().await.is_none());
        assert!(mux.send("AT", "").await.is_err());
    }
}
