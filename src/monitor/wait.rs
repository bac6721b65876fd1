//! Wait strategies between monitor ticks
//!
//! A strategy never waits longer than the bound it is given, which keeps the
//! monitor's deadline guarantee independent of the strategy.

use async_broadcast::{Receiver, RecvError, TryRecvError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

use crate::subtask::SubtaskId;

#[async_trait]
pub trait WaitStrategy: Send {
    /// Suspend for at most `max`
    async fn wait(&mut self, max: Duration);
}

/// Sleeps the full bound
#[derive(Debug, Default, Clone, Copy)]
pub struct PollingWait;

#[async_trait]
impl WaitStrategy for PollingWait {
    async fn wait(&mut self, max: Duration) {
        sleep(max).await;
    }
}

/// Wakes early when the store reports a write
pub struct NotifyWait {
    rx: Receiver<SubtaskId>,
}

impl NotifyWait {
    pub fn new(rx: Receiver<SubtaskId>) -> Self {
        Self { rx }
    }

    // Coalesce a burst of writes into one wake-up.
    fn drain(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(_) | Err(TryRecvError::Overflowed(_)) => continue,
                Err(_) => break,
            }
        }
    }
}

#[async_trait]
impl WaitStrategy for NotifyWait {
    async fn wait(&mut self, max: Duration) {
        let started = Instant::now();
        match timeout(max, self.rx.recv()).await {
            Ok(Ok(_)) | Ok(Err(RecvError::Overflowed(_))) => self.drain(),
            // Feed gone: degrade to polling for the rest of the bound.
            Ok(Err(RecvError::Closed)) => sleep(max.saturating_sub(started.elapsed())).await,
            Err(_) => {}
        }
    }
}
