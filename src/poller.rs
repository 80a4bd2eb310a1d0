//! Poller scheduler
//!
//! Each poller runs in its own tokio task: check the stop flag, run one tick,
//! classify any error, then sleep. The sleep is cut short by `stop`. Ticks of
//! one poller never overlap and errors never escape the loop.

use std::time::Duration;

use async_trait::async_trait;
use eyre::{eyre, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error_parser::{ErrorParser, ParsedError};

#[async_trait]
pub trait Poller: Send {
    fn name(&self) -> String;

    fn polling_interval(&self) -> Duration;

    /// One unit of work
    async fn tick(&mut self) -> Result<()>;

    /// Called after a failed tick, before the poller sleeps
    async fn on_tick_error(&mut self, _error: &eyre::Report, _parsed: &ParsedError) {}
}

/// Running poller task
pub struct PollerHandle {
    name: String,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn start(poller: Box<dyn Poller>) -> Self {
        let name = poller.name();
        let (stop_tx, stop_rx) = watch::channel(false);

        info!(poller = %name, interval_ms = poller.polling_interval().as_millis() as u64, "Starting poller");
        let task = tokio::spawn(run(poller, stop_rx));

        Self { name, stop_tx, task }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request a stop; the current tick is allowed to finish
    pub fn stop(&self) {
        info!(poller = %self.name, "Stopping poller");
        // Receiver already gone means the task has ended
        let _ = self.stop_tx.send(true);
    }

    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| eyre!("Poller {} task failed: {}", self.name, e))
    }
}

async fn run(mut poller: Box<dyn Poller>, mut stop_rx: watch::Receiver<bool>) {
    let name = poller.name();
    let interval = poller.polling_interval();

    loop {
        if *stop_rx.borrow() {
            break;
        }

        let mut delay = interval;
        if let Err(err) = poller.tick().await {
            let parsed = ErrorParser::classify(&err);
            if parsed.mitigation.should_retry {
                warn!(
                    poller = %name,
                    code = %parsed.code,
                    error = %format!("{:#}", err),
                    "Poller tick failed, will retry"
                );
            } else {
                error!(
                    poller = %name,
                    code = %parsed.code,
                    error = %format!("{:#}", err),
                    "Poller tick failed with non-retryable error"
                );
            }

            poller.on_tick_error(&err, &parsed).await;

            if let Some(extra) = parsed.mitigation.blocking_delay() {
                delay += extra;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(poller = %name, "Poller stopped");
}
