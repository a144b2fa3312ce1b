//! Scripted AT channel for driver tests.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::transport::{AtChannel, AtResponse, ChannelError};

/// An [`AtChannel`] that answers from a script and lets tests inject
/// unsolicited lines.
#[derive(Default)]
pub struct MockChannel {
    responses: Mutex<HashMap<String, AtResponse>>,
    sent: Mutex<Vec<String>>,
    subscribers: Mutex<Vec<(String, mpsc::UnboundedSender<String>)>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a successful response; unscripted commands answer plain
    /// `OK`.
    pub fn script(&self, command: &str, lines: &[&str]) {
        self.responses.lock().unwrap().insert(
            command.to_string(),
            AtResponse {
                lines: lines.iter().map(|l| l.to_string()).collect(),
                final_line: "OK".to_string(),
                ok: true,
            },
        );
    }

    /// Script a failing response.
    #[allow(dead_code)]
    pub fn script_error(&self, command: &str, final_line: &str) {
        self.responses.lock().unwrap().insert(
            command.to_string(),
            AtResponse {
                lines: Vec::new(),
                final_line: final_line.to_string(),
                ok: false,
            },
        );
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self, command: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|sent| sent.as_str() == command)
            .count()
    }

    pub async fn wait_sent_count(&self, command: &str, want: usize) {
        for _ in 0..500 {
            if self.sent_count(command) >= want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("{command} was not sent {want} times");
    }

    /// Deliver an unsolicited line to matching subscriptions.
    pub fn inject(&self, line: &str) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|(prefix, tx)| {
                if line.starts_with(prefix.as_str()) {
                    return tx.send(line.to_string()).is_ok();
                }
                !tx.is_closed()
            });
    }
}

#[async_trait]
impl AtChannel for MockChannel {
    async fn send(&self, command: &str, _prefix: &str) -> Result<AtResponse, ChannelError> {
        self.sent.lock().unwrap().push(command.to_string());

        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(command)
            .cloned()
            .unwrap_or(AtResponse {
                lines: Vec::new(),
                final_line: "OK".to_string(),
                ok: true,
            }))
    }

    fn subscribe(&self, prefix: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap()
            .push((prefix.to_string(), tx));
        rx
    }
}
