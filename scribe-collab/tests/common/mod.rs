//! Shared fixtures: a real server on a free port and logged-in clients.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use scribe_collab::auth::{AccountStore, AuthConfig, Credentials};
use scribe_collab::channel::{
    ChannelConfig, ChannelEvent, CloseReason, SyncChannel, TransportState,
};
use scribe_collab::directory::{AccessService, DocumentDirectory};
use scribe_collab::editor::{EditorBinding, EditorSurface, RemoteCursor};
use scribe_collab::permission::{PermissionGate, PermissionSource, Role};
use scribe_collab::server::{ServerConfig, SyncServer};
use scribe_collab::session::SessionContext;
use scribe_collab::SyncError;
use scribe_core::TextRun;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration, Instant};
use uuid::Uuid;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct TestServer {
    pub server: Arc<SyncServer>,
    pub url: String,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(ServerConfig::default()).await
    }

    pub async fn with_storage(path: PathBuf) -> Self {
        Self::start_with(ServerConfig {
            storage_path: Some(path),
            ..ServerConfig::default()
        })
        .await
    }

    pub async fn start_with(config: ServerConfig) -> Self {
        let accounts = Arc::new(AccountStore::new(AuthConfig {
            bcrypt_cost: 4,
            ..AuthConfig::default()
        }));
        Self::start_sharing(config, accounts, Arc::new(DocumentDirectory::new())).await
    }

    /// Start a server over existing account and document stores.
    pub async fn start_sharing(
        config: ServerConfig,
        accounts: Arc<AccountStore>,
        directory: Arc<DocumentDirectory>,
    ) -> Self {
        init_logging();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(SyncServer::new(config, accounts, directory).await.unwrap());
        tokio::spawn(server.clone().serve(listener));
        Self {
            server,
            url: format!("ws://{addr}/ws"),
        }
    }

    pub fn accounts(&self) -> &Arc<AccountStore> {
        self.server.accounts()
    }

    pub fn directory(&self) -> &Arc<DocumentDirectory> {
        self.server.directory()
    }

    /// Fast reconnects so tests don't sit in backoff.
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            server_url: self.url.clone(),
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(200),
            presence_interval: Duration::from_millis(10),
            connect_timeout: Duration::from_secs(2),
            ..ChannelConfig::default()
        }
    }

    /// Register `name` and log a fresh client session in.
    pub async fn user(&self, name: &str) -> TestUser {
        let credentials = Credentials::new(name, "correct horse");
        let registered = self.accounts().register(&credentials).await.unwrap();

        let session = SessionContext::new(self.accounts().clone());
        session.login(&credentials).await.unwrap();
        let source: Arc<dyn PermissionSource> = Arc::new(AccessService::new(
            self.accounts().clone(),
            self.directory().clone(),
        ));
        let gate = Arc::new(PermissionGate::new(session.clone(), source));

        TestUser {
            name: name.to_string(),
            user_id: registered.user_id,
            credentials,
            session,
            gate,
        }
    }

    /// A document owned by `owner`, with `grants` applied.
    pub async fn document(&self, owner: &TestUser, grants: &[(&TestUser, Role)]) -> Uuid {
        let doc = self.directory().create(owner.user_id, "Notes").await.id;
        for (user, role) in grants {
            self.directory()
                .grant(owner.user_id, doc, user.user_id, *role)
                .await
                .unwrap();
        }
        doc
    }

    /// Open an editor and wait until its channel is serving.
    pub async fn open(&self, user: &TestUser, doc: Uuid) -> EditorBinding<RecordingSurface> {
        let mut binding = self.open_unready(user, doc).await.unwrap();
        assert!(
            pump_until(&mut binding, |b| b.session_id().is_some()).await,
            "{} never got a Welcome for {doc}",
            user.name
        );
        binding
    }

    pub async fn open_unready(
        &self,
        user: &TestUser,
        doc: Uuid,
    ) -> Result<EditorBinding<RecordingSurface>, SyncError> {
        EditorBinding::open(
            doc,
            user.session.clone(),
            user.gate.clone(),
            self.channel_config(),
            RecordingSurface::default(),
        )
        .await
    }
}

pub struct TestUser {
    pub name: String,
    pub user_id: Uuid,
    pub credentials: Credentials,
    pub session: SessionContext,
    pub gate: Arc<PermissionGate>,
}

/// Surface that remembers what it was told to show.
#[derive(Debug, Default)]
pub struct RecordingSurface {
    pub text: String,
    pub renders: usize,
    pub cursors: Vec<RemoteCursor>,
    pub read_only: bool,
    pub statuses: Vec<TransportState>,
    pub closed: Option<CloseReason>,
}

impl EditorSurface for RecordingSurface {
    fn render(&mut self, runs: &[TextRun]) {
        self.text = runs.iter().map(|run| run.text.as_str()).collect();
        self.renders += 1;
    }

    fn render_cursors(&mut self, cursors: &[RemoteCursor]) {
        self.cursors = cursors.to_vec();
    }

    fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    fn set_status(&mut self, state: TransportState) {
        self.statuses.push(state);
    }

    fn on_closed(&mut self, reason: CloseReason) {
        self.closed = Some(reason);
    }
}

/// Drive `binding` until `done` holds. Returns false on timeout or once the
/// channel has nothing more to deliver.
pub async fn pump_until<S, F>(binding: &mut EditorBinding<S>, mut done: F) -> bool
where
    S: EditorSurface,
    F: FnMut(&EditorBinding<S>) -> bool,
{
    let deadline = Instant::now() + WAIT;
    while !done(binding) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, binding.next_event()).await {
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return done(binding),
        }
    }
    true
}

/// Pump for a fixed time, e.g. to show that something does *not* arrive.
pub async fn pump_for<S: EditorSurface>(binding: &mut EditorBinding<S>, duration: Duration) {
    let _ = timeout(duration, async {
        while binding.next_event().await.is_some() {}
    })
    .await;
}

/// Wait until the server's copy of `doc` reads `expected`.
pub async fn server_text_becomes(server: &SyncServer, doc: Uuid, expected: &str) -> bool {
    let deadline = Instant::now() + WAIT;
    loop {
        if server.document_text(doc).await.as_deref() == Some(expected) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until exactly `count` rooms are loaded.
pub async fn rooms_become(server: &SyncServer, count: usize) -> bool {
    let deadline = Instant::now() + WAIT;
    loop {
        if server.stats().await.active_rooms == count {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Drain a bare channel until it reports why it closed.
pub async fn close_reason(channel: &mut SyncChannel) -> Option<CloseReason> {
    timeout(WAIT, async {
        while let Some(event) = channel.next_event().await {
            if let ChannelEvent::Closed(reason) = event {
                return Some(reason);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}
