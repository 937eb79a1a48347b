//! Event bus: a single mux task owns the subscriber list and fans out
//! typed events with a non-blocking, drop-when-full send per subscriber.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

use crate::models::{Build, Repo};

const SUBSCRIBER_BUFFER: usize = 48;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// A typed event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum Event {
    #[serde(rename = "repo")]
    Repo(Repo),
    #[serde(rename = "removeRepo")]
    RemoveRepo { name: String },
    #[serde(rename = "build")]
    Build { repo: String, build: Box<Build> },
    #[serde(rename = "removeBuild")]
    RemoveBuild { repo: String, build_id: i64 },
    #[serde(rename = "output")]
    Output {
        build_id: i64,
        step: String,
        #[serde(rename = "where")]
        stream: OutputStream,
        text: String,
    },
    #[serde(rename = "keepalive")]
    Keepalive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

struct Subscriber {
    tx: mpsc::Sender<Event>,
}

enum MuxMsg {
    Publish(Event),
    Subscribe(mpsc::Sender<Event>),
}

/// A live subscription. Dropping it lets the mux notice on the next send
/// failure and remove the entry.
pub struct Subscription {
    pub rx: mpsc::Receiver<Event>,
}

/// Handle used by producers to publish events and by consumers to
/// subscribe. Cheap to clone; backed by a single mpsc sender into the mux
/// task.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<MuxMsg>,
}

impl EventBus {
    /// Spawns the mux task and the keepalive ticker, returning a handle.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<MuxMsg>(256);

        tokio::spawn(async move {
            let mut subscribers: Vec<Subscriber> = Vec::new();
            while let Some(msg) = rx.recv().await {
                match msg {
                    MuxMsg::Subscribe(sub_tx) => subscribers.push(Subscriber { tx: sub_tx }),
                    MuxMsg::Publish(event) => {
                        subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
                            Ok(()) => true,
                            Err(mpsc::error::TrySendError::Full(_)) => true,
                            Err(mpsc::error::TrySendError::Closed(_)) => false,
                        });
                    }
                }
            }
        });

        let keepalive_tx = tx.clone();
        tokio::spawn(async move {
            let mut ticker = interval(KEEPALIVE_INTERVAL);
            loop {
                ticker.tick().await;
                if keepalive_tx
                    .send(MuxMsg::Publish(Event::Keepalive))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        Self { tx }
    }

    pub async fn publish(&self, event: Event) {
        let _ = self.tx.send(MuxMsg::Publish(event)).await;
    }

    pub async fn subscribe(&self) -> Subscription {
        let (sub_tx, sub_rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let _ = self.tx.send(MuxMsg::Subscribe(sub_tx)).await;
        Subscription { rx: sub_rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BuildId, BuildStatus, RepoId};

    fn sample_build() -> Build {
        Build {
            id: BuildId(1),
            repo_id: RepoId(1),
            branch: "main".to_string(),
            commit_hash: String::new(),
            status: BuildStatus::New,
            start: chrono::Utc::now(),
            finish: None,
            error_message: None,
            last_line: None,
            released: None,
            builddir_removed: false,
            disk_usage: None,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::spawn();
        let mut sub = bus.subscribe().await;

        bus.publish(Event::Build {
            repo: "demo".to_string(),
            build: Box::new(sample_build()),
        })
        .await;

        let event = sub.rx.recv().await.unwrap();
        matches!(event, Event::Build { .. });
    }

    #[tokio::test]
    async fn full_subscriber_buffer_drops_without_blocking_others() {
        let bus = EventBus::spawn();
        let mut slow = bus.subscribe().await;
        let mut fast = bus.subscribe().await;

        for _ in 0..(SUBSCRIBER_BUFFER + 10) {
            bus.publish(Event::RemoveRepo {
                name: "demo".to_string(),
            })
            .await;
        }

        // fast subscriber still observes events even though slow's buffer
        // has overflowed and started dropping.
        assert!(fast.rx.try_recv().is_ok());
        let _ = slow.rx.try_recv();
    }
}
