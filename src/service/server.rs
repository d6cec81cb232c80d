//! Server endpoint: TCP listener, client registry, broadcast.
//!
//! The accept loop admits sockets while the registry is below the client
//! cap, runs the accepting side of the handshake on each, and registers
//! the session only after a successful join. `remove_client` is the
//! single mutation path for disconnects and fires the disconnect hook
//! exactly once per registered session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ServerSettings;
use crate::core::package::Package;
use crate::error::{constants, Result, TransportError};
use crate::service::session::ServerSession;

/// Server-assigned identifier of a connected session: 16 random bytes,
/// compared by value, unique within the live registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId([u8; 16]);

impl ClientId {
    pub(crate) fn random() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&BASE64.encode(self.0))
    }
}

impl std::fmt::Debug for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientId({self})")
    }
}

type IdHook = Box<dyn Fn(ClientId) + Send + Sync>;
type BlobHook = Box<dyn Fn(ClientId, Vec<u8>) + Send + Sync>;
type StringHook = Box<dyn Fn(ClientId, String) + Send + Sync>;

/// Observer hooks fired by the server. Registered at construction,
/// snapshot on fire.
#[derive(Default)]
pub struct ServerHooks {
    client_connected: Option<IdHook>,
    client_disconnected: Option<IdHook>,
    client_panic: Option<IdHook>,
    blob_received: Option<BlobHook>,
    string_received: Option<StringHook>,
}

impl ServerHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fired once per successful join.
    pub fn on_client_connected<F>(mut self, hook: F) -> Self
    where
        F: Fn(ClientId) + Send + Sync + 'static,
    {
        self.client_connected = Some(Box::new(hook));
        self
    }

    /// Fired exactly once per registered session when it leaves the
    /// registry.
    pub fn on_client_disconnected<F>(mut self, hook: F) -> Self
    where
        F: Fn(ClientId) + Send + Sync + 'static,
    {
        self.client_disconnected = Some(Box::new(hook));
        self
    }

    /// Fired after a panic recovery completed and the session resumed.
    pub fn on_client_panic<F>(mut self, hook: F) -> Self
    where
        F: Fn(ClientId) + Send + Sync + 'static,
    {
        self.client_panic = Some(Box::new(hook));
        self
    }

    /// Fired for blob- and byte-typed data packages.
    pub fn on_blob_received<F>(mut self, hook: F) -> Self
    where
        F: Fn(ClientId, Vec<u8>) + Send + Sync + 'static,
    {
        self.blob_received = Some(Box::new(hook));
        self
    }

    /// Fired for string-typed data packages.
    pub fn on_string_received<F>(mut self, hook: F) -> Self
    where
        F: Fn(ClientId, String) + Send + Sync + 'static,
    {
        self.string_received = Some(Box::new(hook));
        self
    }

    pub(crate) fn fire_client_connected(&self, id: ClientId) {
        if let Some(hook) = &self.client_connected {
            hook(id);
        }
    }

    pub(crate) fn fire_client_disconnected(&self, id: ClientId) {
        if let Some(hook) = &self.client_disconnected {
            hook(id);
        }
    }

    pub(crate) fn fire_client_panic(&self, id: ClientId) {
        if let Some(hook) = &self.client_panic {
            hook(id);
        }
    }

    pub(crate) fn fire_blob_received(&self, id: ClientId, blob: Vec<u8>) {
        if let Some(hook) = &self.blob_received {
            hook(id, blob);
        }
    }

    pub(crate) fn fire_string_received(&self, id: ClientId, text: String) {
        if let Some(hook) = &self.string_received {
            hook(id, text);
        }
    }
}

/// State shared between the server handle, the accept loop, and the
/// sessions.
pub(crate) struct ServerShared {
    pub(crate) settings: ServerSettings,
    pub(crate) registry: RwLock<HashMap<ClientId, Arc<ServerSession>>>,
    pub(crate) hooks: ServerHooks,
}

impl ServerShared {
    /// The single mutation path for disconnects. Fires the disconnect
    /// hook exactly once per registered session.
    pub(crate) async fn remove_client(&self, id: ClientId) -> Option<Arc<ServerSession>> {
        let removed = self.registry.write().await.remove(&id);
        if removed.is_some() {
            info!(client = %id, "client removed");
            self.hooks.fire_client_disconnected(id);
        }
        removed
    }
}

/// The server endpoint.
pub struct Server {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Bind the listener and start accepting clients.
    #[instrument(skip(settings, hooks), err)]
    pub async fn bind<A: ToSocketAddrs + std::fmt::Debug>(
        addr: A,
        settings: ServerSettings,
        hooks: ServerHooks,
    ) -> Result<Self> {
        settings.validate_strict()?;

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening");

        let shared = Arc::new(ServerShared {
            settings,
            registry: RwLock::new(HashMap::new()),
            hooks,
        });
        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&shared),
            cancel.clone(),
        ));

        Ok(Self {
            shared,
            local_addr,
            cancel,
            accept_task: StdMutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn client_count(&self) -> usize {
        self.shared.registry.read().await.len()
    }

    pub async fn client_ids(&self) -> Vec<ClientId> {
        self.shared.registry.read().await.keys().copied().collect()
    }

    async fn session(&self, id: ClientId) -> Result<Arc<ServerSession>> {
        self.shared
            .registry
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(TransportError::State(constants::ERR_NOT_CONNECTED))
    }

    async fn snapshot(&self) -> Vec<Arc<ServerSession>> {
        self.shared.registry.read().await.values().cloned().collect()
    }

    /// Fan a blob out to every connected client, concurrently.
    /// Per-client failures stay in that client's fault path.
    pub async fn broadcast_blob(&self, blob: &[u8]) {
        let sessions = self.snapshot().await;
        futures::future::join_all(sessions.iter().map(|session| async move {
            if let Err(e) = session.send_blob(blob).await {
                debug!(client = %session.id(), error = %e, "broadcast send failed");
            }
        }))
        .await;
    }

    /// Fan a string out to every connected client, concurrently.
    pub async fn broadcast_string(&self, text: &str) {
        let sessions = self.snapshot().await;
        futures::future::join_all(sessions.iter().map(|session| async move {
            if let Err(e) = session.send_string(text).await {
                debug!(client = %session.id(), error = %e, "broadcast send failed");
            }
        }))
        .await;
    }

    pub async fn send_blob_to(&self, id: ClientId, blob: &[u8]) -> Result<()> {
        self.session(id).await?.send_blob(blob).await
    }

    pub async fn send_byte_to(&self, id: ClientId, value: u8) -> Result<()> {
        self.session(id).await?.send_byte(value).await
    }

    pub async fn send_string_to(&self, id: ClientId, text: &str) -> Result<()> {
        self.session(id).await?.send_string(text).await
    }

    /// Enqueue a raw package for one client.
    pub async fn send_package_to(&self, id: ClientId, pkg: Package) -> Result<()> {
        self.session(id).await?.send_package(pkg)
    }

    /// Run a fresh validation pass against one client, outside the
    /// handshake.
    pub async fn validate_client(&self, id: ClientId) -> Result<()> {
        self.session(id).await?.validate().await
    }

    /// Dispatch a disconnect to one client and remove it.
    pub async fn disconnect_client(&self, id: ClientId) -> Result<()> {
        self.session(id).await?.kick().await;
        Ok(())
    }

    /// Stop accepting, disconnect every client, release the listener.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let task = self
            .accept_task
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(task) = task {
            let _ = task.await;
        }
        let sessions: Vec<_> = self.shared.registry.read().await.values().cloned().collect();
        for session in sessions {
            session.kick().await;
        }
        info!("server shut down");
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ServerShared>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        if shared.registry.read().await.len() >= shared.settings.max_clients {
            warn!(%peer, "client cap reached, refusing connection");
            drop(stream);
            continue;
        }

        tokio::spawn(admit(
            Arc::clone(&shared),
            stream,
            peer,
            cancel.child_token(),
        ));
    }
    debug!("accept loop ended");
}

#[instrument(skip(shared, stream, cancel))]
async fn admit(
    shared: Arc<ServerShared>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let id = {
        let registry = shared.registry.read().await;
        loop {
            let candidate = ClientId::random();
            if !registry.contains_key(&candidate) {
                break candidate;
            }
        }
    };

    let session = ServerSession::new(id, stream, Arc::clone(&shared), cancel);
    match session.join().await {
        Ok(()) => {
            shared
                .registry
                .write()
                .await
                .insert(id, Arc::clone(&session));
            shared.hooks.fire_client_connected(id);
            session.start();
            info!(client = %id, %peer, "client joined");
        }
        Err(e) => {
            debug!(%peer, error = %e, "join failed, closing socket");
            session.discard().await;
        }
    }
}
