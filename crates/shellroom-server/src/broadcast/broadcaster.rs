//! Fan-out of terminal output and presence to every connection.
//!
//! Every connection registers one bounded observer channel. Session output
//! goes to the owner first with an awaited send, then to everyone else with
//! `try_send`; an observer whose channel is full or closed is dropped from
//! the delivery set, so it can never hold back the owner. Dropping only
//! closes the observer channel: the connection keeps its presence entry and
//! may [`Broadcaster::resubscribe`] once it has drained its backlog.

use crate::session::{RingBuffer, SessionEvent, SessionOutput};
use shellroom_core::messages::{
    DataPayload, EndedPayload, ObservedOutputPayload, PresencePayload, UserPayload,
};
use shellroom_core::Message;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection identifier, unique for the lifetime of the process.
pub type ConnId = u64;

/// Capacity of each observer channel.
pub const OBSERVER_CHANNEL: usize = 256;
/// Per-user output kept for replay to new observers.
pub const SCROLLBACK_BYTES: usize = 64 * 1024;

struct Observer {
    /// `None` while dropped from the delivery set.
    tx: Option<mpsc::Sender<Message>>,
    /// Set once the connection has joined.
    username: Option<String>,
}

pub struct Broadcaster {
    observers: RwLock<HashMap<ConnId, Observer>>,
    scrollback: Mutex<HashMap<String, RingBuffer>>,
    next_conn: AtomicU64,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            scrollback: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
        }
    }

    /// Add a connection to the observer set. It immediately receives the
    /// scrollback of every online user and the current presence list.
    pub async fn register(&self) -> (ConnId, mpsc::Receiver<Message>) {
        let conn_id = self.next_conn.fetch_add(1, Ordering::SeqCst);
        let mut observers = self.observers.write().await;
        let rx = self.open_view(&mut observers, conn_id, None);
        debug!(conn_id, observers = observers.len(), "observer registered");
        (conn_id, rx)
    }

    /// Give a connection that was dropped for falling behind a fresh observer
    /// channel, starting again from scrollback. `None` once unregistered.
    pub async fn resubscribe(&self, conn_id: ConnId) -> Option<mpsc::Receiver<Message>> {
        let mut observers = self.observers.write().await;
        let username = observers.get(&conn_id)?.username.clone();
        let rx = self.open_view(&mut observers, conn_id, username);
        debug!(conn_id, "observer resubscribed");
        Some(rx)
    }

    /// New channel primed with the scrollback replay and a presence snapshot.
    fn open_view(
        &self,
        observers: &mut HashMap<ConnId, Observer>,
        conn_id: ConnId,
        username: Option<String>,
    ) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(OBSERVER_CHANNEL);
        let replay: Vec<(String, Vec<u8>)> = {
            let scrollback = self.scrollback.lock().unwrap_or_else(PoisonError::into_inner);
            scrollback
                .iter()
                .filter(|(u, rb)| !rb.is_empty() && Some(u.as_str()) != username.as_deref())
                .map(|(u, rb)| (u.clone(), rb.read_all()))
                .collect()
        };
        for (username, data) in replay {
            let _ = tx.try_send(Message::ObservedOutput(ObservedOutputPayload { username, data }));
        }
        let _ = tx.try_send(presence_message(observers));
        observers.insert(
            conn_id,
            Observer {
                tx: Some(tx),
                username,
            },
        );
        rx
    }

    /// Bind a joined username to a connection and push the presence change.
    pub async fn mark_online(&self, conn_id: ConnId, username: &str) {
        let newly_online = {
            let mut observers = self.observers.write().await;
            let already = online_users(&observers).contains(username);
            match observers.get_mut(&conn_id) {
                Some(observer) => observer.username = Some(username.to_string()),
                None => return,
            }
            !already
        };

        if newly_online {
            info!(conn_id, username, "user online");
            let joined = Message::UserJoined(UserPayload {
                username: username.to_string(),
            });
            self.deliver(Some(conn_id), &joined).await;
        }
        self.push_presence().await;
    }

    /// Remove a connection. Pushes `user-left` if it was that user's last one.
    pub async fn unregister(&self, conn_id: ConnId) {
        self.remove_observers(vec![conn_id]).await;
    }

    /// Pump one session's output: owner first, observers best-effort.
    pub fn attach(
        self: &Arc<Self>,
        owner_conn: ConnId,
        mut output: SessionOutput,
        owner_tx: mpsc::Sender<Message>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let username = output.username().to_string();
            let session_id = output.session_id();
            debug!(session_id, username = %username, owner_conn, "output pump started");

            while let Some(event) = output.next().await {
                match event {
                    SessionEvent::Output(data) => {
                        this.record_scrollback(&username, &data);
                        let observed = Message::ObservedOutput(ObservedOutputPayload {
                            username: username.clone(),
                            data: data.clone(),
                        });
                        if owner_tx
                            .send(Message::TerminalOutput(DataPayload { data }))
                            .await
                            .is_err()
                        {
                            debug!(session_id, "owner connection gone");
                        }
                        this.deliver(Some(owner_conn), &observed).await;
                    }
                    SessionEvent::Ended { exit_code } => {
                        let _ = owner_tx
                            .send(Message::TerminalEnded(EndedPayload { exit_code }))
                            .await;
                        let ended = Message::ObservedEnded(UserPayload {
                            username: username.clone(),
                        });
                        this.deliver(Some(owner_conn), &ended).await;
                    }
                }
            }
            debug!(session_id, username = %username, "output pump finished");
        })
    }

    /// Push a message to every connection.
    pub async fn announce(&self, message: Message) {
        self.deliver(None, &message).await;
    }

    /// Forget a user's scrollback (their container was replaced).
    pub fn clear_scrollback(&self, username: &str) {
        self.scrollback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(username);
    }

    #[cfg(test)]
    pub async fn online(&self) -> Vec<String> {
        online_users(&*self.observers.read().await)
            .into_iter()
            .collect()
    }

    /// Drop a connection from the delivery set as if it had fallen behind.
    #[cfg(test)]
    pub async fn force_unsubscribe(&self, conn_id: ConnId) {
        let tx = self
            .observers
            .read()
            .await
            .get(&conn_id)
            .and_then(|o| o.tx.clone());
        if let Some(tx) = tx {
            self.unsubscribe(vec![(conn_id, tx)]).await;
        }
    }

    /// Whether the connection is currently in the delivery set.
    #[cfg(test)]
    pub async fn is_subscribed(&self, conn_id: ConnId) -> bool {
        self.observers
            .read()
            .await
            .get(&conn_id)
            .is_some_and(|o| o.tx.is_some())
    }

    fn record_scrollback(&self, username: &str, data: &[u8]) {
        self.scrollback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(username.to_string())
            .or_insert_with(|| RingBuffer::new(SCROLLBACK_BYTES))
            .write(data);
    }

    async fn push_presence(&self) {
        let message = presence_message(&*self.observers.read().await);
        self.deliver(None, &message).await;
    }

    /// Deliver to everyone but `except`, then drop whoever could not take it
    /// from the delivery set.
    async fn deliver(&self, except: Option<ConnId>, message: &Message) {
        let failed = self.try_deliver(except, message).await;
        if !failed.is_empty() {
            self.unsubscribe(failed).await;
        }
    }

    /// Observers whose channel was full or closed, with the sender that failed.
    async fn try_deliver(
        &self,
        except: Option<ConnId>,
        message: &Message,
    ) -> Vec<(ConnId, mpsc::Sender<Message>)> {
        let observers = self.observers.read().await;
        observers
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .filter_map(|(id, observer)| observer.tx.as_ref().map(|tx| (*id, tx)))
            .filter(|(_, tx)| tx.try_send(message.clone()).is_err())
            .map(|(id, tx)| (id, tx.clone()))
            .collect()
    }

    /// Close the observer channel of each failed connection. Presence is
    /// untouched. A channel replaced by `resubscribe` in the meantime stays.
    async fn unsubscribe(&self, failed: Vec<(ConnId, mpsc::Sender<Message>)>) {
        let mut observers = self.observers.write().await;
        for (id, failed_tx) in failed {
            let Some(observer) = observers.get_mut(&id) else {
                continue;
            };
            let current = observer
                .tx
                .as_ref()
                .is_some_and(|tx| tx.same_channel(&failed_tx));
            if current {
                if failed_tx.is_closed() {
                    debug!(conn_id = id, "observer channel closed");
                } else {
                    warn!(conn_id = id, "dropping observer that cannot keep up");
                }
                observer.tx = None;
            }
        }
    }

    /// Remove connections and announce users that went offline.
    async fn remove_observers(&self, ids: Vec<ConnId>) {
        let (departed, presence) = {
            let mut observers = self.observers.write().await;
            let mut departed = Vec::new();
            for id in ids {
                let Some(observer) = observers.remove(&id) else {
                    continue;
                };
                debug!(conn_id = id, "observer unregistered");
                if let Some(username) = observer.username {
                    let still_online = observers
                        .values()
                        .any(|o| o.username.as_deref() == Some(username.as_str()));
                    if !still_online {
                        departed.push(username);
                    }
                }
            }
            (departed, presence_message(&observers))
        };

        if departed.is_empty() {
            return;
        }
        for username in departed {
            info!(username = %username, "user offline");
            self.clear_scrollback(&username);
            self.deliver(None, &Message::UserLeft(UserPayload { username }))
                .await;
        }
        self.deliver(None, &presence).await;
    }
}

fn online_users(observers: &HashMap<ConnId, Observer>) -> BTreeSet<String> {
    observers
        .values()
        .filter_map(|o| o.username.clone())
        .collect()
}

fn presence_message(observers: &HashMap<ConnId, Observer>) -> Message {
    Message::Presence(PresencePayload {
        users: online_users(observers).into_iter().collect(),
    })
}
