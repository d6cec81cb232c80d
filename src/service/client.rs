//! Client endpoint.
//!
//! Dials the server, runs the joining side of the handshake, then drives
//! the same obtain/dispatch engine the server sessions use. The client
//! answers pings and out-of-handshake validation rounds, follows the
//! server into panic recovery, and announces its own recoverable faults
//! with a `Panic` package before rejoining.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ExportedSettings, DEFAULT_MAX_PANICS};
use crate::core::package::{decode_utf16le, encode_utf16le, DataType, Package, PackageType};
use crate::error::{constants, Fault, Result, TransportError};
use crate::protocol::handler::{PackageHandler, PackageHooks};
use crate::protocol::handshake;
use crate::utils::crypto::AesContext;
use crate::utils::timeout::{with_deadline, DEFAULT_RECEIVE_TIMEOUT, JOIN_TIMEOUT};
use zeroize::Zeroizing;

type UnitHook = Box<dyn Fn() + Send + Sync>;
type BlobHook = Box<dyn Fn(Vec<u8>) + Send + Sync>;
type StringHook = Box<dyn Fn(String) + Send + Sync>;

/// Observer hooks fired by the client endpoint. Registered at
/// construction, snapshot on fire.
#[derive(Default)]
pub struct ClientHooks {
    connected: Option<UnitHook>,
    disconnected: Option<UnitHook>,
    panic: Option<UnitHook>,
    blob_received: Option<BlobHook>,
    string_received: Option<StringHook>,
}

impl ClientHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.connected = Some(Box::new(hook));
        self
    }

    pub fn on_disconnected<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.disconnected = Some(Box::new(hook));
        self
    }

    /// Fired after a panic recovery completed and traffic resumed.
    pub fn on_panic<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.panic = Some(Box::new(hook));
        self
    }

    /// Fired for blob- and byte-typed data packages.
    pub fn on_blob_received<F>(mut self, hook: F) -> Self
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        self.blob_received = Some(Box::new(hook));
        self
    }

    pub fn on_string_received<F>(mut self, hook: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.string_received = Some(Box::new(hook));
        self
    }

    fn fire_connected(&self) {
        if let Some(hook) = &self.connected {
            hook();
        }
    }

    fn fire_disconnected(&self) {
        if let Some(hook) = &self.disconnected {
            hook();
        }
    }

    fn fire_panic(&self) {
        if let Some(hook) = &self.panic {
            hook();
        }
    }

    fn fire_blob_received(&self, blob: Vec<u8>) {
        if let Some(hook) = &self.blob_received {
            hook(blob);
        }
    }

    fn fire_string_received(&self, text: String) {
        if let Some(hook) = &self.string_received {
            hook(text);
        }
    }
}

/// The client endpoint. One session at a time.
pub struct Client {
    hooks: Arc<ClientHooks>,
    receive_timeout: Duration,
    max_panics: u8,
    session: Mutex<Option<Arc<ClientSession>>>,
}

impl Client {
    pub fn new(hooks: ClientHooks) -> Self {
        Self {
            hooks: Arc::new(hooks),
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            max_panics: DEFAULT_MAX_PANICS,
            session: Mutex::new(None),
        }
    }

    /// Set the per-byte-class read deadline used by this endpoint.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Dial the server and run the joining side of the handshake.
    ///
    /// Returns `Ok(true)` once joined with both loops running, and
    /// `Ok(false)` when the dial or the join failed. `Err` is reserved
    /// for misuse such as connecting an already-connected endpoint.
    pub async fn connect<A: ToSocketAddrs>(
        &self,
        addr: A,
        password: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let mut slot = self.session.lock().await;
        if slot.as_ref().is_some_and(|session| !session.is_closed()) {
            return Err(TransportError::State(constants::ERR_ALREADY_CONNECTED));
        }

        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                info!(error = %e, "dial failed");
                return Ok(false);
            }
        };

        let handler = Arc::new(PackageHandler::new(stream, self.receive_timeout));
        match handshake::client_join(&handler, password, cancel).await {
            Ok(join) => {
                let session = ClientSession::new(
                    handler,
                    join,
                    password,
                    Arc::clone(&self.hooks),
                    self.max_panics,
                );
                session.start();
                *slot = Some(session);
                self.hooks.fire_connected();
                info!("connected");
                Ok(true)
            }
            Err(e) => {
                info!(error = %e, "join failed");
                handler.close().await;
                Ok(false)
            }
        }
    }

    /// Stop the loops, announce the disconnect, release the socket.
    pub async fn disconnect(&self) -> Result<()> {
        let session = self
            .session
            .lock()
            .await
            .take()
            .ok_or(TransportError::State(constants::ERR_NOT_CONNECTED))?;
        session.shutdown_graceful().await;
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|session| !session.is_closed())
    }

    pub async fn send_blob(&self, blob: &[u8]) -> Result<()> {
        self.current_session().await?.send_blob(blob).await
    }

    pub async fn send_byte(&self, value: u8) -> Result<()> {
        self.current_session().await?.send_byte(value).await
    }

    pub async fn send_string(&self, text: &str) -> Result<()> {
        self.current_session().await?.send_string(text).await
    }

    /// Enqueue a raw package.
    pub async fn send_package(&self, pkg: Package) -> Result<()> {
        self.current_session().await?.send_package(pkg)
    }

    /// Send a blob and resolve once its bytes hit the wire.
    pub async fn send_blob_await(&self, blob: &[u8], cancel: &CancellationToken) -> Result<()> {
        self.current_session()
            .await?
            .send_blob_await(blob, cancel)
            .await
    }

    async fn current_session(&self) -> Result<Arc<ClientSession>> {
        self.session
            .lock()
            .await
            .as_ref()
            .filter(|session| !session.is_closed())
            .cloned()
            .ok_or(TransportError::State(constants::ERR_NOT_CONNECTED))
    }
}

struct ClientSession {
    handler: Arc<PackageHandler>,
    aes: RwLock<Option<AesContext>>,
    settings: RwLock<ExportedSettings>,
    password: Option<Zeroizing<String>>,
    hooks: Arc<ClientHooks>,
    panic_count: AtomicU8,
    panic_lock: Mutex<()>,
    max_panics: u8,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl ClientSession {
    fn new(
        handler: Arc<PackageHandler>,
        join: handshake::ClientJoin,
        password: Option<&str>,
        hooks: Arc<ClientHooks>,
        max_panics: u8,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler,
            aes: RwLock::new(join.aes),
            settings: RwLock::new(join.settings),
            password: password.map(|password| Zeroizing::new(password.to_owned())),
            hooks,
            panic_count: AtomicU8::new(0),
            panic_lock: Mutex::new(()),
            max_panics,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn start(self: &Arc<Self>) {
        let hooks: Arc<dyn PackageHooks> = Arc::clone(self) as Arc<dyn PackageHooks>;
        self.handler.start_all(hooks);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn send_blob(&self, blob: &[u8]) -> Result<()> {
        let payload = self.seal(blob).await?;
        self.handler.send(Package::data_with(DataType::Blob, payload))
    }

    async fn send_byte(&self, value: u8) -> Result<()> {
        let payload = self.seal(&[value]).await?;
        self.handler.send(Package::data_with(DataType::Byte, payload))
    }

    async fn send_string(&self, text: &str) -> Result<()> {
        let payload = self.seal(&encode_utf16le(text)).await?;
        self.handler
            .send(Package::data_with(DataType::String, payload))
    }

    fn send_package(&self, pkg: Package) -> Result<()> {
        self.handler.send(pkg)
    }

    async fn send_blob_await(&self, blob: &[u8], cancel: &CancellationToken) -> Result<()> {
        let payload = self.seal(blob).await?;
        self.handler
            .send_await(Package::data_with(DataType::Blob, payload), cancel)
            .await
    }

    /// User-driven disconnect: stop the loops, announce, close. Fires
    /// the disconnected hook if this call did the closing.
    async fn shutdown_graceful(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.handler.stop_all().await;
        let _ = self
            .handler
            .dispatch(Package::internal(PackageType::DisconnectRequest))
            .await;
        self.handler.close().await;
        self.hooks.fire_disconnected();
        info!("disconnected");
    }

    /// Peer-driven or fault-driven teardown. Safe from inside a hook.
    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.handler.close().await;
        self.hooks.fire_disconnected();
        info!("connection closed");
    }

    async fn handle_fault(&self, fault: Fault) {
        if self.is_closed() {
            return;
        }
        warn!(%fault, "connection fault");
        if fault.is_terminal() {
            self.close().await;
            return;
        }
        self.rejoin(true).await;
    }

    /// Re-run the joining side of the handshake. When this endpoint hit
    /// the fault itself, it announces with a `Panic` package first; when
    /// the server announced, the auth-info frame is already on its way.
    async fn rejoin(&self, announce: bool) {
        let _serialized = self.panic_lock.lock().await;
        if self.is_closed() {
            return;
        }

        self.handler.pause_all().await;

        let panics = self.panic_count.fetch_add(1, Ordering::AcqRel) + 1;
        if panics > self.max_panics {
            warn!(panics, "panic cap exceeded, closing");
            self.close().await;
            return;
        }

        if announce {
            if self
                .handler
                .dispatch(Package::internal(PackageType::Panic))
                .await
                .is_err()
            {
                self.close().await;
                return;
            }
            handshake::panic_quiescence().await;
        }

        debug!(panics, "running panic recovery join");
        let password = self.password.as_deref().map(String::as_str);
        let rejoin = with_deadline(
            JOIN_TIMEOUT,
            handshake::client_join(&self.handler, password, &self.cancel),
        );
        match rejoin.await {
            Ok(join) => {
                *self.aes.write().await = join.aes;
                *self.settings.write().await = join.settings;
                self.handler.resume_all();
                self.hooks.fire_panic();
                info!("panic recovery complete");
            }
            Err(e) => {
                warn!(error = %e, "panic recovery failed");
                self.close().await;
            }
        }
    }

    async fn seal(&self, plain: &[u8]) -> Result<Vec<u8>> {
        match self.aes.read().await.as_ref() {
            Some(ctx) => ctx.encrypt(plain),
            None => Ok(plain.to_vec()),
        }
    }

    async fn open(&self, wire: &[u8]) -> Result<Vec<u8>> {
        match self.aes.read().await.as_ref() {
            Some(ctx) => ctx.decrypt(wire),
            None => Ok(wire.to_vec()),
        }
    }
}

#[async_trait]
impl PackageHooks for ClientSession {
    async fn on_internal(&self, pkg: Package) {
        match pkg.package_type {
            PackageType::Ping => {
                self.handler.pause_dispatch().await;
                let _ = self
                    .handler
                    .dispatch(Package::internal(PackageType::Pong))
                    .await;
                self.handler.resume_dispatch();
            }
            PackageType::Pong => {}
            PackageType::Disconnect => {
                self.close().await;
            }
            PackageType::Panic => {
                self.rejoin(false).await;
            }
            PackageType::TestRequest => {
                // Out-of-handshake validation pass initiated by the
                // server; the obtain loop is parked in this hook, so only
                // dispatch needs pausing.
                self.handler.pause_dispatch().await;
                let tries = self.settings.read().await.connection_test_tries;
                let result = {
                    let aes = self.aes.read().await;
                    handshake::answer_validation_rounds(
                        &self.handler,
                        aes.as_ref(),
                        tries,
                        &self.cancel,
                    )
                    .await
                };
                self.handler.resume_dispatch();
                if let Err(e) = result {
                    warn!(error = %e, "validation pass failed");
                    self.handle_fault(Fault::IncorrectPackage).await;
                }
            }
            PackageType::None => {}
            _ => self.handle_fault(Fault::UnexpectedPackage).await,
        }
    }

    async fn on_data(&self, mut pkg: Package) {
        let payload = pkg.take_payload();
        let opened = match self.open(&payload).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(error = %e, "data payload failed to decrypt");
                self.handle_fault(Fault::IncorrectPackage).await;
                return;
            }
        };

        match pkg.data_type {
            DataType::String => match decode_utf16le(&opened) {
                Ok(text) => self.hooks.fire_string_received(text),
                Err(e) => {
                    warn!(error = %e, "malformed string payload");
                    self.handle_fault(Fault::IncorrectPackage).await;
                }
            },
            DataType::Byte | DataType::Blob | DataType::Empty => {
                self.hooks.fire_blob_received(opened);
            }
        }
    }

    async fn on_error(&self, fault: Fault) {
        self.handle_fault(fault).await;
    }
}
