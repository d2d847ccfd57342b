// Owned background tasks: dropping the handle stops the task

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// A spawned task that is aborted when this value is dropped or replaced.
#[derive(Debug)]
pub struct OwnedTask {
    handle: JoinHandle<()>,
}

impl OwnedTask {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    /// Deliver `message` once after `delay`.
    pub fn once<T>(delay: Duration, tx: UnboundedSender<T>, message: T) -> Self
    where
        T: Send + 'static,
    {
        Self::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(message);
        })
    }

    /// Deliver a copy of `message` every `period`, first after one full period.
    pub fn every<T>(period: Duration, tx: UnboundedSender<T>, message: T) -> Self
    where
        T: Clone + Send + 'static,
    {
        Self::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if tx.send(message.clone()).is_err() {
                    break;
                }
            }
        })
    }
}

impl Drop for OwnedTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
