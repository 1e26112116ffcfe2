use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::client::ChatClient;
use crate::events::EventAdapter;

/// Periodic task that evicts expired verifications
pub struct ExpirySweeper {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ExpirySweeper {
    pub fn spawn<C: ChatClient>(adapter: Arc<EventAdapter<C>>, period: Duration) -> Self {
        let (stop, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // A slow pass must not cause a burst of catch-up sweeps
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut ticks = IntervalStream::new(interval);

            info!("Expiry sweeper running every {:?}", period);
            loop {
                tokio::select! {
                    tick = ticks.next() => {
                        if tick.is_none() {
                            break;
                        }
                        let requested = adapter.on_tick(Utc::now()).await;
                        if requested > 0 {
                            debug!("Sweep requested {} effect(s)", requested);
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            info!("Expiry sweeper stopped");
        });

        Self { stop, handle }
    }

    /// Cancel the sweep loop and wait for an in-flight pass to finish
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            warn!("Expiry sweeper ended abnormally: {}", e);
        }
    }
}
