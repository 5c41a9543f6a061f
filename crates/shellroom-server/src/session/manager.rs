//! Terminal session lifecycle.
//!
//! One session = one interactive login shell inside a user's container,
//! running under a host PTY. Output is exposed as a [`SessionOutput`]
//! producer; input goes through an ordered channel drained by a blocking
//! writer, so byte order is preserved in both directions.

use super::pty::{PtyHandle, DEFAULT_COLS, DEFAULT_ROWS};
use crate::container::{ContainerHandle, ContainerRuntime};
use shellroom_core::{RoomError, RoomResult};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Monotonically assigned session identifier.
pub type SessionId = u64;

const READ_CHUNK: usize = 4096;
const OUTPUT_CHANNEL: usize = 256;

/// What a session produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output(Vec<u8>),
    /// Always the last event.
    Ended { exit_code: Option<i32> },
}

/// Non-restartable producer of one session's output.
pub struct SessionOutput {
    session_id: SessionId,
    username: String,
    rx: mpsc::Receiver<SessionEvent>,
    ended: bool,
}

impl SessionOutput {
    pub(crate) fn from_receiver(
        session_id: SessionId,
        username: impl Into<String>,
        rx: mpsc::Receiver<SessionEvent>,
    ) -> Self {
        Self {
            session_id,
            username: username.into(),
            rx,
            ended: false,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Next chunk in order. Yields exactly one `Ended`, then `None` forever.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        if self.ended {
            return None;
        }
        match self.rx.recv().await {
            Some(SessionEvent::Output(data)) => Some(SessionEvent::Output(data)),
            Some(ended @ SessionEvent::Ended { .. }) => {
                self.ended = true;
                Some(ended)
            }
            None => {
                self.ended = true;
                Some(SessionEvent::Ended { exit_code: None })
            }
        }
    }
}

struct Session {
    username: String,
    container: ContainerHandle,
    pty: Arc<PtyHandle>,
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    alive: Arc<AtomicBool>,
    created_at: Instant,
}

type SessionMap = Arc<RwLock<HashMap<SessionId, Session>>>;

/// Owns every live terminal session.
pub struct SessionManager {
    runtime: Arc<dyn ContainerRuntime>,
    sessions: SessionMap,
    /// Slots reserved by `create_session` calls still spawning their PTY.
    pending: AtomicUsize,
    next_id: AtomicU64,
    max_sessions: usize,
}

/// A capacity slot held while a session is being created.
struct Reservation<'a> {
    pending: &'a AtomicUsize,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SessionManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, max_sessions: usize) -> Self {
        Self {
            runtime,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            pending: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            max_sessions,
        }
    }

    /// Spawn a login shell for `username` inside `container`.
    pub async fn create_session(
        &self,
        username: &str,
        container: &ContainerHandle,
    ) -> RoomResult<(SessionId, SessionOutput)> {
        let reservation = self.reserve().await?;

        match self.runtime.inspect(container).await {
            Ok(Some(status)) if status.running => {}
            Ok(Some(status)) => {
                return Err(RoomError::SessionCreationFailed(format!(
                    "container {container} is {}",
                    status.state
                )))
            }
            Ok(None) => {
                return Err(RoomError::SessionCreationFailed(format!(
                    "container {container} does not exist"
                )))
            }
            Err(e) => return Err(RoomError::SessionCreationFailed(e.to_string())),
        }

        let argv = self.runtime.interactive_command(container, username);
        let (pty, streams) = PtyHandle::spawn(&argv, DEFAULT_COLS, DEFAULT_ROWS)?;
        let pty = Arc::new(pty);

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_CHANNEL);
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        // Registered before the reader starts, so an instant exit still
        // finds its entry to remove.
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(
                id,
                Session {
                    username: username.to_string(),
                    container: container.clone(),
                    pty: pty.clone(),
                    input_tx,
                    alive: alive.clone(),
                    created_at: Instant::now(),
                },
            );
            drop(reservation);
        }
        info!(session_id = id, username, container = %container, "session created");

        spawn_reader(
            id,
            streams.reader,
            pty,
            alive,
            out_tx,
            Arc::clone(&self.sessions),
        );
        spawn_writer(id, streams.writer, input_rx);

        Ok((id, SessionOutput::from_receiver(id, username, out_rx)))
    }

    /// Take a capacity slot. Checked and taken under the map's write lock
    /// so concurrent creators cannot overshoot `max_sessions`.
    async fn reserve(&self) -> RoomResult<Reservation<'_>> {
        let sessions = self.sessions.write().await;
        if sessions.len() + self.pending.load(Ordering::SeqCst) >= self.max_sessions {
            return Err(RoomError::SessionCreationFailed(format!(
                "max sessions ({}) reached",
                self.max_sessions
            )));
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        Ok(Reservation {
            pending: &self.pending,
        })
    }

    /// Queue input. A no-op once the process has exited.
    pub async fn write(&self, id: SessionId, data: Vec<u8>) -> RoomResult<()> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(&id).ok_or(RoomError::SessionNotFound(id))?;
        if !session.alive.load(Ordering::SeqCst) {
            return Ok(());
        }
        debug!(session_id = id, len = data.len(), "session input");
        let _ = session.input_tx.send(data);
        Ok(())
    }

    /// Forward a terminal size change. Failures are logged.
    pub async fn resize(&self, id: SessionId, cols: u16, rows: u16) -> RoomResult<()> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(&id).ok_or(RoomError::SessionNotFound(id))?;
        if session.pty.size() == (cols, rows) {
            return Ok(());
        }
        debug!(session_id = id, from = ?session.pty.size(), cols, rows, "session resize");
        if let Err(e) = session.pty.resize(cols, rows) {
            warn!(session_id = id, error = %e, "resize failed");
        }
        Ok(())
    }

    /// Terminate the session's process. Returns false if it was already
    /// closed or its process had already exited.
    pub async fn close(&self, id: SessionId) -> bool {
        let removed = self.sessions.write().await.remove(&id);
        match removed {
            Some(session) => {
                session.alive.store(false, Ordering::SeqCst);
                session.pty.kill();
                info!(
                    session_id = id,
                    username = %session.username,
                    container = %session.container,
                    age_secs = session.created_at.elapsed().as_secs(),
                    "session closed"
                );
                true
            }
            None => false,
        }
    }

    /// Close every session owned by `username`.
    pub async fn close_user(&self, username: &str) -> usize {
        let ids: Vec<SessionId> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.username == username)
            .map(|(id, _)| *id)
            .collect();
        let mut closed = 0;
        for id in ids {
            if self.close(id).await {
                closed += 1;
            }
        }
        closed
    }

    /// Username a live session belongs to.
    pub async fn owner(&self, id: SessionId) -> Option<String> {
        self.sessions.read().await.get(&id).map(|s| s.username.clone())
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Blocking reader: PTY output → channel. Once the process is gone the
/// session is unregistered, then `Ended` is sent.
fn spawn_reader(
    id: SessionId,
    mut reader: Box<dyn Read + Send>,
    pty: Arc<PtyHandle>,
    alive: Arc<AtomicBool>,
    out_tx: mpsc::Sender<SessionEvent>,
    sessions: SessionMap,
) {
    let chunk_tx = out_tx.clone();
    let blocking = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                // EIO on Linux once the child side is gone.
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if chunk_tx
                        .blocking_send(SessionEvent::Output(buf[..n].to_vec()))
                        .is_err()
                    {
                        debug!(session_id = id, "output consumer gone, killing session");
                        pty.kill();
                        break;
                    }
                }
            }
        }
        alive.store(false, Ordering::SeqCst);
        pty.wait_blocking()
    });

    tokio::spawn(async move {
        let exit_code = match blocking.await {
            Ok(code) => code,
            Err(e) => {
                warn!(session_id = id, error = %e, "session reader failed");
                None
            }
        };
        // Dropping the entry releases the PTY master.
        let removed = sessions.write().await.remove(&id);
        if let Some(session) = removed {
            info!(
                session_id = id,
                username = %session.username,
                ?exit_code,
                age_secs = session.created_at.elapsed().as_secs(),
                "session process ended"
            );
        }
        let _ = out_tx.send(SessionEvent::Ended { exit_code }).await;
    });
}

/// Blocking writer draining the ordered input queue.
fn spawn_writer(
    id: SessionId,
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    tokio::task::spawn_blocking(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                debug!(session_id = id, error = %e, "PTY write failed, stopping writer");
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::fake::FakeRuntime;
    use std::time::Duration;

    fn manager(runtime: Arc<FakeRuntime>) -> SessionManager {
        SessionManager::new(runtime, 8)
    }

    fn running(runtime: &FakeRuntime, name: &str) -> ContainerHandle {
        runtime.seed(name, true);
        ContainerHandle::new(name)
    }

    /// Collect output until `needle` shows up or the session ends.
    async fn read_until(output: &mut SessionOutput, needle: &str) -> String {
        let mut seen = Vec::new();
        let deadline = Duration::from_secs(10);
        let _ = tokio::time::timeout(deadline, async {
            while let Some(event) = output.next().await {
                match event {
                    SessionEvent::Output(data) => {
                        seen.extend_from_slice(&data);
                        if String::from_utf8_lossy(&seen).contains(needle) {
                            break;
                        }
                    }
                    SessionEvent::Ended { .. } => break,
                }
            }
        })
        .await;
        String::from_utf8_lossy(&seen).to_string()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn echo_round_trip() {
        let runtime = Arc::new(FakeRuntime::new());
        let handle = running(&runtime, "linuxdo-carol");
        let sessions = manager(runtime);

        let (id, mut output) = sessions.create_session("carol", &handle).await.unwrap();
        assert_eq!(output.username(), "carol");
        sessions
            .write(id, b"echo marker-$((1+1))\n".to_vec())
            .await
            .unwrap();

        let text = read_until(&mut output, "marker-2").await;
        assert!(text.contains("marker-2"), "got {text:?}");
        sessions.close(id).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exit_ends_the_stream_and_unregisters() {
        let runtime = Arc::new(FakeRuntime::new());
        let handle = running(&runtime, "linuxdo-carol");
        let sessions = manager(runtime);

        let (id, mut output) = sessions.create_session("carol", &handle).await.unwrap();
        sessions.write(id, b"exit 3\n".to_vec()).await.unwrap();

        let ended = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match output.next().await {
                    Some(SessionEvent::Ended { exit_code }) => break exit_code,
                    Some(SessionEvent::Output(_)) => continue,
                    None => break None,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(ended, Some(3));
        assert!(output.next().await.is_none());

        // Unregistered before `Ended` is delivered.
        assert_eq!(sessions.count().await, 0);
        assert!(matches!(
            sessions.write(id, b"echo late\n".to_vec()).await,
            Err(RoomError::SessionNotFound(_))
        ));
        assert!(!sessions.close(id).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exited_session_frees_its_slot() {
        let runtime = Arc::new(FakeRuntime::new());
        let handle = running(&runtime, "linuxdo-carol");
        let sessions = SessionManager::new(runtime, 1);

        let (id, mut output) = sessions.create_session("carol", &handle).await.unwrap();
        sessions.write(id, b"exit 0\n".to_vec()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = output.next().await {
                if matches!(event, SessionEvent::Ended { .. }) {
                    break;
                }
            }
        })
        .await
        .unwrap();

        let (second, mut output) = sessions.create_session("carol", &handle).await.unwrap();
        assert_ne!(second, id);
        sessions
            .write(second, b"echo again-$((3+4))\n".to_vec())
            .await
            .unwrap();
        assert!(read_until(&mut output, "again-7").await.contains("again-7"));
        assert!(sessions.close(second).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_is_idempotent_and_isolated() {
        let runtime = Arc::new(FakeRuntime::new());
        let a = running(&runtime, "linuxdo-alice");
        let b = running(&runtime, "linuxdo-bob");
        let sessions = manager(runtime);

        let (id_a, _out_a) = sessions.create_session("alice", &a).await.unwrap();
        let (id_b, mut out_b) = sessions.create_session("bob", &b).await.unwrap();
        assert!(id_b > id_a);

        assert!(sessions.close(id_a).await);
        assert!(!sessions.close(id_a).await);
        assert!(matches!(
            sessions.write(id_a, b"x".to_vec()).await,
            Err(RoomError::SessionNotFound(_))
        ));

        sessions.write(id_b, b"echo still-$((2+3))\n".to_vec()).await.unwrap();
        assert!(read_until(&mut out_b, "still-5").await.contains("still-5"));
        assert_eq!(sessions.count().await, 1);
        assert_eq!(sessions.owner(id_b).await.as_deref(), Some("bob"));
        assert_eq!(sessions.close_user("bob").await, 1);
        assert_eq!(sessions.count().await, 0);
    }

    #[tokio::test]
    async fn container_must_be_running() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.seed("linuxdo-dave", false);
        let sessions = manager(runtime);

        let err = sessions
            .create_session("dave", &ContainerHandle::new("linuxdo-dave"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RoomError::SessionCreationFailed(_)));

        let err = sessions
            .create_session("erin", &ContainerHandle::new("linuxdo-erin"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RoomError::SessionCreationFailed(_)));
        assert_eq!(sessions.count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn capacity_is_enforced_and_resize_reaches_the_pty() {
        let runtime = Arc::new(FakeRuntime::new());
        let handle = running(&runtime, "linuxdo-carol");
        let sessions = SessionManager::new(runtime, 1);

        let (id, mut output) = sessions.create_session("carol", &handle).await.unwrap();
        assert!(sessions.create_session("carol", &handle).await.is_err());

        sessions.resize(id, 100, 30).await.unwrap();
        sessions.write(id, b"stty size\n".to_vec()).await.unwrap();
        assert!(read_until(&mut output, "30 100").await.contains("30 100"));

        assert_eq!(sessions.count().await, 1);
        assert_eq!(sessions.owner(id).await.as_deref(), Some("carol"));
        sessions.close(id).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_respect_capacity() {
        let runtime = Arc::new(FakeRuntime::new());
        let handle = running(&runtime, "linuxdo-carol");
        let sessions = Arc::new(SessionManager::new(runtime, 2));

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let sessions = sessions.clone();
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                sessions.create_session("carol", &handle).await.ok()
            }));
        }
        let mut created = Vec::new();
        for task in tasks {
            if let Some(session) = task.await.unwrap() {
                created.push(session);
            }
        }

        assert_eq!(created.len(), 2);
        assert_eq!(sessions.count().await, 2);
        for (id, _output) in created {
            sessions.close(id).await;
        }
    }

    #[tokio::test]
    async fn producer_synthesizes_end_when_sender_drops() {
        let (tx, rx) = mpsc::channel(4);
        let mut output = SessionOutput::from_receiver(9, "carol", rx);
        tx.send(SessionEvent::Output(b"hi".to_vec())).await.unwrap();
        drop(tx);

        assert_eq!(output.next().await, Some(SessionEvent::Output(b"hi".to_vec())));
        assert_eq!(
            output.next().await,
            Some(SessionEvent::Ended { exit_code: None })
        );
        assert_eq!(output.next().await, None);
        assert_eq!(output.session_id(), 9);
    }
}
