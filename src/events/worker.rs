//! Serial event worker.
//!
//! Join and verify events are queued on a channel and handled one at a time
//! by a single task. The expiry sweeper runs beside it and meets it only at
//! the pending store's claim primitives.

use poise::serenity_prelude::UserId;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::adapter::EventAdapter;
use crate::client::ChatClient;
use crate::error::{BotError, Result};
use crate::managers::verification_manager::{JoiningMember, Reply};
use crate::state::ChatRef;

const QUEUE_CAPACITY: usize = 256;

/// An inbound platform event
#[derive(Debug)]
pub enum Inbound {
    Join {
        chat: ChatRef,
        members: Vec<JoiningMember>,
    },
    Verify {
        requester: UserId,
        text: String,
        reply: oneshot::Sender<Reply>,
    },
}

/// Cloneable handle for queueing events onto the worker
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Inbound>,
}

impl EventSender {
    pub async fn join(&self, chat: ChatRef, members: Vec<JoiningMember>) -> Result<()> {
        self.tx
            .send(Inbound::Join { chat, members })
            .await
            .map_err(|_| worker_gone())
    }

    /// Queue a verify attempt and wait for its reply
    pub async fn verify(&self, requester: UserId, text: impl Into<String>) -> Result<Reply> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Inbound::Verify {
                requester,
                text: text.into(),
                reply,
            })
            .await
            .map_err(|_| worker_gone())?;
        rx.await.map_err(|_| worker_gone())
    }
}

fn worker_gone() -> BotError {
    BotError::Internal {
        message: "event worker is not running".to_string(),
    }
}

/// Handle to the running worker task
pub struct EventWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl EventWorker {
    pub fn spawn<C: ChatClient>(adapter: Arc<EventAdapter<C>>) -> (EventSender, Self) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(adapter, rx, shutdown_rx));

        (EventSender { tx }, Self { shutdown, handle })
    }

    /// Stop accepting events, finish everything already queued, then return
    pub async fn drain(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!("Event worker ended abnormally: {}", e);
        }
    }
}

async fn run<C: ChatClient>(
    adapter: Arc<EventAdapter<C>>,
    mut rx: mpsc::Receiver<Inbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => handle(&adapter, event).await,
                None => break,
            },
            _ = shutdown.changed() => {
                rx.close();
                let mut drained = 0;
                while let Some(event) = rx.recv().await {
                    handle(&adapter, event).await;
                    drained += 1;
                }
                info!("Event worker drained {} queued event(s)", drained);
                break;
            }
        }
    }
    debug!("Event worker stopped");
}

async fn handle<C: ChatClient>(adapter: &EventAdapter<C>, event: Inbound) {
    match event {
        Inbound::Join { chat, members } => adapter.on_join(chat, &members).await,
        Inbound::Verify {
            requester,
            text,
            reply,
        } => {
            let outcome = adapter.on_verify_attempt(requester, &text).await;
            // The requester may have gone away (e.g. closed the page)
            let _ = reply.send(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::RecordingClient;
    use crate::managers::verification_manager::VerificationManager;
    use crate::state::create_shared_pending_store;
    use poise::serenity_prelude::{ChannelId, GuildId};
    use std::time::Duration;

    fn adapter() -> Arc<EventAdapter<RecordingClient>> {
        let manager = Arc::new(VerificationManager::new(
            create_shared_pending_store(),
            Duration::from_secs(180),
            Duration::from_secs(30),
        )
        .unwrap());
        Arc::new(EventAdapter::new(
            manager,
            Arc::new(RecordingClient::new()),
            Duration::from_secs(180),
        ))
    }

    fn joining(id: u64) -> JoiningMember {
        JoiningMember {
            user_id: UserId::new(id),
            display_name: format!("m{}", id),
            is_bot: false,
        }
    }

    #[tokio::test]
    async fn test_events_processed_in_order() {
        let adapter = adapter();
        let (events, worker) = EventWorker::spawn(adapter.clone());
        let chat = ChatRef::new(GuildId::new(1), ChannelId::new(2));

        events.join(chat, vec![joining(11)]).await.unwrap();
        let reply = events.verify(UserId::new(11), "verify_11").await.unwrap();

        assert_eq!(reply, Reply::Success);
        assert_eq!(adapter.manager().pending_count(), 0);
        worker.drain().await;
    }

    #[tokio::test]
    async fn test_drain_handles_queued_events() {
        let adapter = adapter();
        let (events, worker) = EventWorker::spawn(adapter.clone());
        let chat = ChatRef::new(GuildId::new(1), ChannelId::new(2));

        for id in 1..=5 {
            events.join(chat, vec![joining(id)]).await.unwrap();
        }
        worker.drain().await;

        assert_eq!(adapter.manager().pending_count(), 5);
        assert!(events.join(chat, vec![joining(9)]).await.is_err());
        assert!(events.verify(UserId::new(1), "verify_1").await.is_err());
    }
}
