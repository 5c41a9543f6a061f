//! Core server: accepts connections and runs one message loop per client.
//!
//! A connection starts in the lobby as an observer. `join` moves it through
//! provisioning (in a background task, so fan-out keeps flowing) into the
//! joined state, where it owns exactly one terminal session.

use crate::broadcast::{Broadcaster, ConnId};
use crate::chat::ChatService;
use crate::config::ServerConfig;
use crate::lifecycle::manager::ProgressSink;
use crate::lifecycle::{ExpirySweeper, LifecycleManager, ProvisionStage, Resolution};
use crate::rate_limit::JoinRateLimit;
use crate::session::{SessionId, SessionManager, SessionOutput};
use crate::transport::websocket::{self, WebSocketConnection};
use shellroom_core::messages::*;
use shellroom_core::{decode_message, ErrorCode, Message, RoomError, RoomResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

/// Capacity of a connection's own outbound queue (owner output, progress).
const OUTBOUND_CHANNEL: usize = 1024;
/// How often join and chat limiters are garbage collected.
const GC_INTERVAL: Duration = Duration::from_secs(60);

enum ConnState {
    Lobby,
    /// A join or reset task is running.
    Provisioning,
    Joined(Joined),
}

struct Joined {
    username: String,
    session_id: SessionId,
}

/// Per-connection context threaded through the message loop.
struct ConnectionContext {
    conn_id: ConnId,
    remote: SocketAddr,
    state: ConnState,
    out_tx: mpsc::Sender<Message>,
    done_tx: mpsc::Sender<Option<Joined>>,
}

enum ProvisionJob {
    Join { username: String, password: String },
    Reset { username: String },
}

impl ProvisionJob {
    fn username(&self) -> &str {
        match self {
            ProvisionJob::Join { username, .. } | ProvisionJob::Reset { username } => username,
        }
    }
}

pub struct RoomServer {
    config: ServerConfig,
    lifecycle: Arc<LifecycleManager>,
    sessions: Arc<SessionManager>,
    broadcaster: Arc<Broadcaster>,
    chat: Arc<ChatService>,
    join_limits: Mutex<JoinRateLimit>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RoomServer {
    pub fn new(
        config: ServerConfig,
        lifecycle: Arc<LifecycleManager>,
        sessions: Arc<SessionManager>,
        broadcaster: Arc<Broadcaster>,
        chat: Arc<ChatService>,
    ) -> Self {
        Self {
            config,
            lifecycle,
            sessions,
            broadcaster,
            chat,
            join_limits: Mutex::new(JoinRateLimit::default()),
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Bind the configured address and serve until the listener closes.
    pub async fn run(self: Arc<Self>) -> RoomResult<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind, self.config.port)
            .parse()
            .map_err(|e| RoomError::Other(format!("invalid listen address: {e}")))?;
        let (local_addr, ws_rx) = websocket::start_listener(addr).await?;
        info!(addr = %local_addr, "shellroom-server ready");
        self.serve(ws_rx).await;
        Ok(())
    }

    /// Tell every connection and background task to stop.
    pub fn shutdown(&self) {
        info!("broadcasting shutdown to connected clients");
        let _ = self.shutdown_tx.send(());
    }

    /// Accept loop over already-upgraded connections.
    pub async fn serve(self: Arc<Self>, mut ws_rx: mpsc::Receiver<WebSocketConnection>) {
        let sweeper = ExpirySweeper::new(self.lifecycle.clone(), self.config.sweep_interval);
        tokio::spawn(sweeper.run(self.shutdown_tx.subscribe()));

        let gc_server = self.clone();
        let mut gc_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let tracked_ips = {
                            let mut limits = gc_server.join_limits.lock().await;
                            limits.gc();
                            limits.tracked_keys()
                        };
                        gc_server.chat.gc();
                        debug!(tracked_ips, "rate limiters collected");
                    }
                    _ = gc_shutdown.recv() => break,
                }
            }
        });

        while let Some(conn) = ws_rx.recv().await {
            let srv = self.clone();
            tokio::spawn(async move {
                let remote = conn.remote_addr;
                if let Err(e) = srv.handle_connection(conn).await {
                    warn!(remote = %remote, error = %e, "connection error");
                }
            });
        }

        info!("listener closed, shutting down");
        self.shutdown();
    }

    async fn handle_connection(self: Arc<Self>, mut conn: WebSocketConnection) -> RoomResult<()> {
        let remote = conn.remote_addr;
        let (conn_id, observer_rx) = self.broadcaster.register().await;
        info!(remote = %remote, conn_id, "client connected");

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CHANNEL);
        let (done_tx, mut done_rx) = mpsc::channel(1);
        let mut ctx = ConnectionContext {
            conn_id,
            remote,
            state: ConnState::Lobby,
            out_tx,
            done_tx,
        };

        let result = self
            .session_loop(&mut conn, &mut ctx, observer_rx, out_rx, &mut done_rx)
            .await;

        // A provisioning task that finishes after this point sees the closed
        // channel and closes its own session.
        done_rx.close();
        while let Ok(Some(joined)) = done_rx.try_recv() {
            self.sessions.close(joined.session_id).await;
        }
        if let ConnState::Joined(joined) = &ctx.state {
            self.sessions.close(joined.session_id).await;
        }
        self.broadcaster.unregister(conn_id).await;
        info!(remote = %remote, conn_id, "client disconnected");
        result
    }

    async fn session_loop(
        self: &Arc<Self>,
        conn: &mut WebSocketConnection,
        ctx: &mut ConnectionContext,
        observer_rx: mpsc::Receiver<Message>,
        mut out_rx: mpsc::Receiver<Message>,
        done_rx: &mut mpsc::Receiver<Option<Joined>>,
    ) -> RoomResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut observer_rx = Some(observer_rx);

        loop {
            let mut fell_behind = false;
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(conn_id = ctx.conn_id, "shutdown signal received, notifying client");
                    let bye = Message::Shutdown(ShutdownPayload {
                        reason: "server shutting down".into(),
                    });
                    let _ = websocket::ws_send_message(&mut conn.ws_stream, &bye).await;
                    break;
                }

                observed = recv_observed(&mut observer_rx) => match observed {
                    Some(message) => websocket::ws_send_message(&mut conn.ws_stream, &message).await?,
                    // Dropped from the delivery set and the backlog is flushed.
                    None => fell_behind = true,
                },

                Some(message) = out_rx.recv() => {
                    if matches!(message, Message::TerminalEnded(_)) {
                        self.leave_ended_session(ctx).await;
                    }
                    websocket::ws_send_message(&mut conn.ws_stream, &message).await?;
                }

                Some(done) = done_rx.recv() => {
                    ctx.state = match done {
                        Some(joined) => {
                            if self.is_live(&joined).await {
                                ConnState::Joined(joined)
                            } else {
                                debug!(
                                    conn_id = ctx.conn_id,
                                    session_id = joined.session_id,
                                    "session ended before join completed"
                                );
                                ConnState::Lobby
                            }
                        }
                        None => ConnState::Lobby,
                    };
                }

                incoming = websocket::ws_recv_binary(&mut conn.ws_stream) => match incoming {
                    Ok(Some(data)) => {
                        let reply = match decode_message(&data) {
                            Ok(message) => self.dispatch_message(message, ctx).await,
                            Err(e) => Some(error_reply(&e)),
                        };
                        if let Some(reply) = reply {
                            websocket::ws_send_message(&mut conn.ws_stream, &reply).await?;
                        }
                    }
                    Ok(None) => {
                        debug!(conn_id = ctx.conn_id, "peer closed");
                        break;
                    }
                    Err(e) => {
                        debug!(conn_id = ctx.conn_id, error = %e, "connection ended");
                        break;
                    }
                },
            }

            if fell_behind {
                info!(conn_id = ctx.conn_id, "observer view fell behind, resyncing");
                observer_rx = self.broadcaster.resubscribe(ctx.conn_id).await;
            }
        }

        Ok(())
    }

    /// Back to the lobby once the joined session is gone, so a fresh `join`
    /// can attach again. A session that was already replaced by a reset is
    /// still live and keeps the connection joined.
    async fn leave_ended_session(&self, ctx: &mut ConnectionContext) {
        let ConnState::Joined(joined) = &ctx.state else {
            return;
        };
        if self.is_live(joined).await {
            return;
        }
        info!(
            conn_id = ctx.conn_id,
            username = %joined.username,
            session_id = joined.session_id,
            "terminal ended, back in the lobby"
        );
        ctx.state = ConnState::Lobby;
    }

    async fn is_live(&self, joined: &Joined) -> bool {
        self.sessions.owner(joined.session_id).await.as_deref() == Some(joined.username.as_str())
    }

    /// Handle one client message. Returns an immediate reply, if any.
    async fn dispatch_message(
        self: &Arc<Self>,
        message: Message,
        ctx: &mut ConnectionContext,
    ) -> Option<Message> {
        debug!(conn_id = ctx.conn_id, kind = message.kind(), "client message");
        match message {
            Message::Join(p) => {
                match ctx.state {
                    ConnState::Lobby => {}
                    ConnState::Provisioning => {
                        return Some(Message::error(
                            ErrorCode::InvalidMessage,
                            "join already in progress",
                        ))
                    }
                    ConnState::Joined(_) => {
                        return Some(Message::error(ErrorCode::InvalidMessage, "already joined"))
                    }
                }
                let allowed = self.join_limits.lock().await.check(&ctx.remote.ip());
                if !allowed {
                    warn!(remote = %ctx.remote, "join rate limited");
                    return Some(error_reply(&RoomError::RateLimited(
                        "too many join attempts, try again in a minute".into(),
                    )));
                }
                if let Err(e) = self.config.username_policy.validate(&p.username) {
                    return Some(error_reply(&e));
                }
                if p.password.is_empty() {
                    return Some(error_reply(&RoomError::WeakPassword(
                        "a password is required".into(),
                    )));
                }
                ctx.state = ConnState::Provisioning;
                self.spawn_provision(
                    ctx,
                    ProvisionJob::Join {
                        username: p.username,
                        password: p.password,
                    },
                );
                None
            }

            Message::TerminalInput(p) => {
                let Some(joined) = joined(ctx) else {
                    return Some(not_joined());
                };
                self.sessions
                    .write(joined.session_id, p.data)
                    .await
                    .err()
                    .map(|e| error_reply(&e))
            }

            Message::TerminalResize(p) => {
                let Some(joined) = joined(ctx) else {
                    return Some(not_joined());
                };
                if p.cols == 0 || p.rows == 0 {
                    return Some(Message::error(
                        ErrorCode::InvalidMessage,
                        "terminal size must be non-zero",
                    ));
                }
                self.sessions
                    .resize(joined.session_id, p.cols, p.rows)
                    .await
                    .err()
                    .map(|e| error_reply(&e))
            }

            Message::ResetContainer => {
                let Some(username) = joined(ctx).map(|j| j.username.clone()) else {
                    return Some(not_joined());
                };
                let closed = self.sessions.close_user(&username).await;
                self.broadcaster.clear_scrollback(&username);
                debug!(username = %username, closed, "sessions closed for reset");
                ctx.state = ConnState::Provisioning;
                self.spawn_provision(ctx, ProvisionJob::Reset { username });
                None
            }

            Message::ExtendContainer => {
                let Some(username) = joined(ctx).map(|j| j.username.clone()) else {
                    return Some(not_joined());
                };
                Some(match self.lifecycle.extend_container(&username).await {
                    Ok(left) => Message::Extended(ExtendedPayload {
                        expires_in_secs: left.as_secs(),
                    }),
                    Err(e) => error_reply(&e),
                })
            }

            Message::ListUsers => {
                let users = self
                    .lifecycle
                    .list_active()
                    .await
                    .into_iter()
                    .map(|c| ActiveUser {
                        username: c.username,
                        handle: c.handle.to_string(),
                        created_at_ms: unix_ms(c.created_at),
                        uptime_secs: c.uptime.as_secs(),
                    })
                    .collect();
                Some(Message::ActiveUsers(ActiveUsersPayload { users }))
            }

            Message::ChatSend(p) => {
                let Some(username) = joined(ctx).map(|j| j.username.clone()) else {
                    return Some(not_joined());
                };
                match self.chat.post(&username, &p.text).await {
                    Ok(posted) => {
                        self.broadcaster
                            .announce(Message::ChatMessage(posted.into()))
                            .await;
                        None
                    }
                    Err(e) => Some(error_reply(&e)),
                }
            }

            Message::ChatHistory(p) => {
                let max = self.config.chat_history_limit.max(1);
                let limit = p.limit.unwrap_or(max).clamp(1, max);
                Some(match self.chat.recent(limit).await {
                    Ok(messages) => Message::ChatMessages(ChatMessagesPayload {
                        messages: messages.into_iter().map(Into::into).collect(),
                    }),
                    Err(e) => error_reply(&e),
                })
            }

            Message::Ping(p) => Some(Message::Pong(p)),

            other => {
                warn!(conn_id = ctx.conn_id, kind = other.kind(), "unexpected message from client");
                Some(Message::error(
                    ErrorCode::InvalidMessage,
                    format!("unexpected message: {}", other.kind()),
                ))
            }
        }
    }

    /// Resolve (or reset) a container and open a session for it, off the
    /// connection loop. Progress, `ready` and errors go through the
    /// connection's outbound queue so they stay in order.
    fn spawn_provision(self: &Arc<Self>, ctx: &ConnectionContext, job: ProvisionJob) {
        let srv = Arc::clone(self);
        let conn_id = ctx.conn_id;
        let out_tx = ctx.out_tx.clone();
        let done_tx = ctx.done_tx.clone();

        tokio::spawn(async move {
            let username = job.username().to_string();
            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProvisionStage>();
            let forward_tx = out_tx.clone();
            let forward = tokio::spawn(async move {
                while let Some(stage) = progress_rx.recv().await {
                    let progress = Message::Progress(ProgressPayload {
                        percent: stage.percent(),
                        message: stage.message().to_string(),
                    });
                    if forward_tx.send(progress).await.is_err() {
                        break;
                    }
                }
            });

            let result = srv.provision(&job, &progress_tx).await;
            drop(progress_tx);
            let _ = forward.await;

            let (resolution, session_id, output) = match result {
                Ok(done) => done,
                Err(e) => {
                    info!(conn_id, username = %username, error = %e, "provisioning failed");
                    let _ = done_tx.send(None).await;
                    let _ = out_tx.send(error_reply(&e)).await;
                    return;
                }
            };

            // The loop sees the joined state before the client sees `ready`.
            let joined = Joined {
                username: username.clone(),
                session_id,
            };
            if done_tx.send(Some(joined)).await.is_err() {
                debug!(conn_id, session_id, "connection gone before join completed");
                srv.sessions.close(session_id).await;
                return;
            }

            let ready = Message::Ready(ReadyPayload {
                handle: resolution.handle.to_string(),
                username: username.clone(),
                created: resolution.created,
                message: resolution.welcome,
                warnings: resolution.warnings,
            });
            if out_tx.send(ready).await.is_err() {
                return;
            }
            srv.broadcaster.attach(conn_id, output, out_tx);
            srv.broadcaster.mark_online(conn_id, &username).await;
            let live_sessions = srv.sessions.count().await;
            info!(
                conn_id,
                username = %username,
                session_id,
                live_sessions,
                "terminal attached"
            );
        });
    }

    async fn provision(
        &self,
        job: &ProvisionJob,
        progress: &ProgressSink,
    ) -> RoomResult<(Resolution, SessionId, SessionOutput)> {
        let resolution = match job {
            ProvisionJob::Join { username, password } => {
                self.lifecycle
                    .resolve(username, password, Some(progress))
                    .await?
            }
            ProvisionJob::Reset { username } => {
                self.lifecycle
                    .reset_container(username, Some(progress))
                    .await?
            }
        };
        let (session_id, output) = self
            .sessions
            .create_session(job.username(), &resolution.handle)
            .await?;
        Ok((resolution, session_id, output))
    }
}

/// Next message on the observer channel; pends forever without one.
async fn recv_observed(rx: &mut Option<mpsc::Receiver<Message>>) -> Option<Message> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn joined(ctx: &ConnectionContext) -> Option<&Joined> {
    match &ctx.state {
        ConnState::Joined(joined) => Some(joined),
        _ => None,
    }
}

fn not_joined() -> Message {
    Message::error(ErrorCode::NotJoined, "join before using the terminal")
}

fn error_reply(e: &RoomError) -> Message {
    Message::error(e.code(), e.to_string())
}

fn unix_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliOverrides, ConfigFile};
    use crate::container::fake::FakeRuntime;
    use crate::db::Database;
    use crate::lifecycle::manager::tests::manager_with;
    use crate::lifecycle::LifecycleConfig;
    use futures_util::{SinkExt, StreamExt};
    use shellroom_core::encode_message;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct TestRoom {
        addr: SocketAddr,
        runtime: Arc<FakeRuntime>,
        broadcaster: Arc<Broadcaster>,
    }

    async fn start_room() -> TestRoom {
        let runtime = Arc::new(FakeRuntime::new());
        let lifecycle = manager_with(runtime.clone(), LifecycleConfig::default()).await;
        let sessions = Arc::new(SessionManager::new(runtime.clone(), 16));
        let db = Database::in_memory().await.unwrap();
        let config =
            ServerConfig::from_file(ConfigFile::default(), CliOverrides::default()).unwrap();
        let chat = Arc::new(ChatService::new(db.pool().clone(), config.chat.clone()));
        let broadcaster = Arc::new(Broadcaster::new());
        let server = Arc::new(RoomServer::new(
            config,
            lifecycle,
            sessions,
            broadcaster.clone(),
            chat,
        ));
        let (addr, rx) = websocket::start_listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        tokio::spawn(server.serve(rx));
        TestRoom {
            addr,
            runtime,
            broadcaster,
        }
    }

    async fn start() -> SocketAddr {
        start_room().await.addr
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        ws
    }

    async fn send(ws: &mut Client, message: Message) {
        ws.send(WsMessage::Binary(encode_message(&message).unwrap()))
            .await
            .unwrap();
    }

    /// Next message matching `pred`; everything before it is skipped.
    async fn expect(ws: &mut Client, pred: impl Fn(&Message) -> bool) -> Message {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Binary(data))) => {
                        let message = decode_message(&data).unwrap();
                        if pred(&message) {
                            return message;
                        }
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("connection ended: {other:?}"),
                }
            }
        })
        .await
        .expect("timed out waiting for message")
    }

    /// Accumulate terminal bytes picked out by `extract` until `needle` shows up.
    async fn read_until(
        ws: &mut Client,
        extract: impl Fn(&Message) -> Option<Vec<u8>>,
        needle: &str,
    ) {
        let mut seen = String::new();
        while !seen.contains(needle) {
            let message = expect(ws, |m| extract(m).is_some()).await;
            if let Some(data) = extract(&message) {
                seen.push_str(&String::from_utf8_lossy(&data));
            }
        }
    }

    fn own_output(m: &Message) -> Option<Vec<u8>> {
        match m {
            Message::TerminalOutput(p) => Some(p.data.clone()),
            _ => None,
        }
    }

    async fn join(ws: &mut Client, username: &str, password: &str) -> Message {
        send(
            ws,
            Message::Join(JoinPayload {
                username: username.into(),
                password: password.into(),
            }),
        )
        .await;
        expect(ws, |m| matches!(m, Message::Ready(_) | Message::Error(_))).await
    }

    async fn input(ws: &mut Client, line: &str) {
        send(
            ws,
            Message::TerminalInput(DataPayload {
                data: line.as_bytes().to_vec(),
            }),
        )
        .await;
    }

    fn ready(m: Message) -> ReadyPayload {
        match m {
            Message::Ready(p) => p,
            other => panic!("expected ready, got {other:?}"),
        }
    }

    fn error_code(m: &Message) -> ErrorCode {
        match m {
            Message::Error(p) => p.code,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn join_reports_progress_then_ready() {
        let addr = start().await;
        let mut ws = connect(addr).await;

        send(
            &mut ws,
            Message::Join(JoinPayload {
                username: "alice".into(),
                password: "secret1".into(),
            }),
        )
        .await;
        let done = expect(&mut ws, |m| {
            matches!(m, Message::Progress(p) if p.percent == 100)
        })
        .await;
        assert!(matches!(done, Message::Progress(_)));

        match expect(&mut ws, |m| matches!(m, Message::Ready(_))).await {
            Message::Ready(ready) => {
                assert_eq!(ready.username, "alice");
                assert_eq!(ready.handle, "linuxdo-alice");
                assert!(ready.created);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn joined_terminal_echoes_input() {
        let addr = start().await;
        let mut ws = connect(addr).await;
        assert!(matches!(join(&mut ws, "alice", "secret1").await, Message::Ready(_)));

        send(
            &mut ws,
            Message::TerminalInput(DataPayload {
                data: b"echo room-$((40+2))\n".to_vec(),
            }),
        )
        .await;
        read_until(&mut ws, own_output, "room-42").await;
    }

    #[tokio::test]
    async fn input_before_join_is_rejected() {
        let addr = start().await;
        let mut ws = connect(addr).await;

        send(
            &mut ws,
            Message::TerminalInput(DataPayload {
                data: b"ls\n".to_vec(),
            }),
        )
        .await;
        let reply = expect(&mut ws, |m| matches!(m, Message::Error(_))).await;
        assert_eq!(error_code(&reply), ErrorCode::NotJoined);

        send(&mut ws, Message::ChatSend(ChatSendPayload { text: "hi".into() })).await;
        let reply = expect(&mut ws, |m| matches!(m, Message::Error(_))).await;
        assert_eq!(error_code(&reply), ErrorCode::NotJoined);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lobby_connection_observes_joined_user() {
        let addr = start().await;
        let mut watcher = connect(addr).await;
        expect(&mut watcher, |m| matches!(m, Message::Presence(_))).await;

        let mut owner = connect(addr).await;
        assert!(matches!(join(&mut owner, "alice", "secret1").await, Message::Ready(_)));

        match expect(&mut watcher, |m| matches!(m, Message::UserJoined(_))).await {
            Message::UserJoined(p) => assert_eq!(p.username, "alice"),
            other => panic!("unexpected {other:?}"),
        }

        send(
            &mut owner,
            Message::TerminalInput(DataPayload {
                data: b"echo seen-by-$((1+1))\n".to_vec(),
            }),
        )
        .await;
        read_until(
            &mut watcher,
            |m| match m {
                Message::ObservedOutput(p) if p.username == "alice" => Some(p.data.clone()),
                _ => None,
            },
            "seen-by-2",
        )
        .await;

        drop(owner);
        match expect(&mut watcher, |m| matches!(m, Message::UserLeft(_))).await {
            Message::UserLeft(p) => assert_eq!(p.username, "alice"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn wrong_password_for_known_user() {
        let addr = start().await;
        let mut first = connect(addr).await;
        assert!(matches!(join(&mut first, "alice", "secret1").await, Message::Ready(_)));

        let mut second = connect(addr).await;
        let reply = join(&mut second, "alice", "wrong99").await;
        assert_eq!(error_code(&reply), ErrorCode::BadCredential);

        // Same connection can retry after a failure.
        assert!(matches!(join(&mut second, "alice", "secret1").await, Message::Ready(_)));
        let reply = join(&mut second, "alice", "secret1").await;
        assert_eq!(error_code(&reply), ErrorCode::InvalidMessage);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn chat_reaches_every_connection() {
        let addr = start().await;
        let mut watcher = connect(addr).await;
        let mut author = connect(addr).await;
        assert!(matches!(join(&mut author, "alice", "secret1").await, Message::Ready(_)));

        send(
            &mut author,
            Message::ChatSend(ChatSendPayload {
                text: "hello room".into(),
            }),
        )
        .await;
        for ws in [&mut watcher, &mut author] {
            match expect(ws, |m| matches!(m, Message::ChatMessage(_))).await {
                Message::ChatMessage(p) => {
                    assert_eq!(p.username, "alice");
                    assert_eq!(p.text, "hello room");
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        send(&mut watcher, Message::ChatHistory(ChatHistoryPayload { limit: None })).await;
        match expect(&mut watcher, |m| matches!(m, Message::ChatMessages(_))).await {
            Message::ChatMessages(p) => assert_eq!(p.messages.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn list_and_extend() {
        let addr = start().await;
        let mut ws = connect(addr).await;

        send(&mut ws, Message::ExtendContainer).await;
        let reply = expect(&mut ws, |m| matches!(m, Message::Error(_))).await;
        assert_eq!(error_code(&reply), ErrorCode::NotJoined);

        assert!(matches!(join(&mut ws, "alice", "secret1").await, Message::Ready(_)));
        send(&mut ws, Message::ListUsers).await;
        match expect(&mut ws, |m| matches!(m, Message::ActiveUsers(_))).await {
            Message::ActiveUsers(p) => {
                assert_eq!(p.users.len(), 1);
                assert_eq!(p.users[0].handle, "linuxdo-alice");
                assert!(p.users[0].created_at_ms > 0);
            }
            other => panic!("unexpected {other:?}"),
        }

        send(&mut ws, Message::ExtendContainer).await;
        match expect(&mut ws, |m| matches!(m, Message::Extended(_))).await {
            Message::Extended(p) => assert_eq!(p.expires_in_secs, 2 * 60 * 60),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_and_unexpected_messages() {
        let addr = start().await;
        let mut ws = connect(addr).await;

        send(&mut ws, Message::Ping(PingPongPayload { id: 7 })).await;
        match expect(&mut ws, |m| matches!(m, Message::Pong(_))).await {
            Message::Pong(p) => assert_eq!(p.id, 7),
            other => panic!("unexpected {other:?}"),
        }

        send(&mut ws, Message::Pong(PingPongPayload { id: 1 })).await;
        let reply = expect(&mut ws, |m| matches!(m, Message::Error(_))).await;
        assert_eq!(error_code(&reply), ErrorCode::InvalidMessage);

        ws.send(WsMessage::Binary(vec![0xff, 0x00, 0x13])).await.unwrap();
        let reply = expect(&mut ws, |m| matches!(m, Message::Error(_))).await;
        assert_eq!(error_code(&reply), ErrorCode::InvalidMessage);
    }

    #[tokio::test]
    async fn join_attempts_are_rate_limited_per_ip() {
        let addr = start().await;
        let mut ws = connect(addr).await;

        for _ in 0..5 {
            let reply = join(&mut ws, "Not Valid", "secret1").await;
            assert_eq!(error_code(&reply), ErrorCode::InvalidUsername);
        }
        let reply = join(&mut ws, "alice", "secret1").await;
        assert_eq!(error_code(&reply), ErrorCode::RateLimited);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn rejoin_after_the_shell_exits() {
        let addr = start().await;
        let mut ws = connect(addr).await;
        assert!(ready(join(&mut ws, "alice", "secret1").await).created);

        input(&mut ws, "exit\n").await;
        expect(&mut ws, |m| matches!(m, Message::TerminalEnded(_))).await;

        input(&mut ws, "echo nowhere\n").await;
        let reply = expect(&mut ws, |m| matches!(m, Message::Error(_))).await;
        assert_eq!(error_code(&reply), ErrorCode::NotJoined);

        let again = ready(join(&mut ws, "alice", "secret1").await);
        assert!(!again.created);
        input(&mut ws, "echo back-$((1+1))\n").await;
        read_until(&mut ws, own_output, "back-2").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reset_replaces_the_container_and_reattaches() {
        let room = start_room().await;
        let mut ws = connect(room.addr).await;
        let mut second = connect(room.addr).await;
        assert!(ready(join(&mut ws, "alice", "secret1").await).created);
        assert!(!ready(join(&mut second, "alice", "secret1").await).created);
        let before = room.runtime.container_id("linuxdo-alice").unwrap();

        send(&mut ws, Message::ResetContainer).await;
        // The old terminal's end and the new `ready` may arrive in either order.
        let mut ended = false;
        let mut fresh = None;
        while !ended || fresh.is_none() {
            match expect(&mut ws, |m| {
                matches!(m, Message::TerminalEnded(_) | Message::Ready(_))
            })
            .await
            {
                Message::TerminalEnded(_) => ended = true,
                other => fresh = Some(ready(other)),
            }
        }
        let fresh = fresh.unwrap();
        assert!(fresh.created);
        assert_eq!(fresh.handle, "linuxdo-alice");

        let after = room.runtime.container_id("linuxdo-alice").unwrap();
        assert_ne!(before, after);
        assert!(room.runtime.is_running("linuxdo-alice"));

        input(&mut ws, "echo reset-$((2+2))\n").await;
        read_until(&mut ws, own_output, "reset-4").await;

        // The other connection of the same user lost its terminal and can
        // join the new container.
        expect(&mut second, |m| matches!(m, Message::TerminalEnded(_))).await;
        input(&mut second, "echo stale\n").await;
        let reply = expect(&mut second, |m| matches!(m, Message::Error(_))).await;
        assert_eq!(error_code(&reply), ErrorCode::NotJoined);
        assert!(!ready(join(&mut second, "alice", "secret1").await).created);
        input(&mut second, "echo second-$((3+3))\n").await;
        read_until(&mut second, own_output, "second-6").await;
        assert_eq!(room.runtime.container_id("linuxdo-alice").unwrap(), after);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slow_observer_view_is_resynced_not_disconnected() {
        let room = start_room().await;
        let mut bob = connect(room.addr).await;
        expect(&mut bob, |m| matches!(m, Message::Presence(_))).await;
        assert!(matches!(join(&mut bob, "bob", "secret1").await, Message::Ready(_)));
        let mut alice = connect(room.addr).await;
        assert!(matches!(join(&mut alice, "alice", "secret1").await, Message::Ready(_)));

        // Bob's connection registered first.
        room.broadcaster.force_unsubscribe(1).await;

        input(&mut alice, "echo alice-$((5+5))\n").await;
        read_until(
            &mut bob,
            |m| match m {
                Message::Shutdown(p) => panic!("connection closed: {}", p.reason),
                Message::ObservedOutput(p) if p.username == "alice" => Some(p.data.clone()),
                _ => None,
            },
            "alice-10",
        )
        .await;

        input(&mut bob, "echo bob-$((6+6))\n").await;
        read_until(&mut bob, own_output, "bob-12").await;
        assert!(room.broadcaster.is_subscribed(1).await);
    }
}
