//! Per-client server session.
//!
//! A session owns the socket, the package handler, the data-channel AES
//! context, and the liveness flags of one connected client. It implements
//! the handler's hook contract, which makes it the place where the fault
//! policy lives: terminal faults remove the client, everything else runs
//! the panic recovery handshake.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::package::{decode_utf16le, DataType, Package, PackageType};
use crate::error::{Fault, Result};
use crate::protocol::handler::{PackageHandler, PackageHooks};
use crate::protocol::handshake;
use crate::protocol::liveness::{self, LivenessFlags, MonitorExit};
use crate::service::server::{ClientId, ServerShared};
use crate::utils::crypto::AesContext;
use crate::utils::timeout::{with_deadline, JOIN_TIMEOUT};

pub(crate) struct ServerSession {
    id: ClientId,
    handler: Arc<PackageHandler>,
    shared: Arc<ServerShared>,
    aes: RwLock<Option<AesContext>>,
    flags: Arc<LivenessFlags>,
    panic_count: AtomicU8,
    panic_lock: Mutex<()>,
    liveness_cancel: CancellationToken,
    cancel: CancellationToken,
    removed: AtomicBool,
}

impl ServerSession {
    pub(crate) fn new(
        id: ClientId,
        stream: TcpStream,
        shared: Arc<ServerShared>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let handler = Arc::new(PackageHandler::new(
            stream,
            shared.settings.receive_timeout,
        ));
        Arc::new(Self {
            id,
            handler,
            shared,
            aes: RwLock::new(None),
            flags: LivenessFlags::new(),
            panic_count: AtomicU8::new(0),
            panic_lock: Mutex::new(()),
            liveness_cancel: CancellationToken::new(),
            cancel,
            removed: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> ClientId {
        self.id
    }

    /// Run the accepting side of the handshake and install the data
    /// channel it produced.
    pub(crate) async fn join(&self) -> Result<()> {
        let aes = with_deadline(
            JOIN_TIMEOUT,
            handshake::server_join(&self.handler, &self.shared.settings, &self.cancel),
        )
        .await?;
        *self.aes.write().await = aes;
        Ok(())
    }

    /// Start the loops and the liveness monitor. Called once, after the
    /// session has been registered.
    pub(crate) fn start(self: &Arc<Self>) {
        let hooks: Arc<dyn PackageHooks> = Arc::clone(self) as Arc<dyn PackageHooks>;
        self.handler.start_all(hooks);

        let interval = self.shared.settings.ping_interval;
        if interval.is_zero() {
            return;
        }
        let timeout = self.shared.settings.ping_timeout;
        let session = Arc::clone(self);
        let cancel = self.liveness_cancel.clone();
        tokio::spawn(async move {
            let exit = liveness::monitor(
                Arc::clone(&session.handler),
                Arc::clone(&session.flags),
                interval,
                timeout,
                cancel,
            )
            .await;
            if exit == MonitorExit::PongMissed {
                session.handle_fault(Fault::PingTimeout).await;
            }
        });
    }

    /// Close the socket of a session that never joined.
    pub(crate) async fn discard(&self) {
        self.removed.store(true, Ordering::Release);
        self.handler.close().await;
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    pub(crate) async fn send_blob(&self, blob: &[u8]) -> Result<()> {
        let payload = self.seal(blob).await?;
        self.handler.send(Package::data_with(DataType::Blob, payload))
    }

    pub(crate) async fn send_byte(&self, value: u8) -> Result<()> {
        let payload = self.seal(&[value]).await?;
        self.handler.send(Package::data_with(DataType::Byte, payload))
    }

    pub(crate) async fn send_string(&self, text: &str) -> Result<()> {
        let encoded = crate::core::package::encode_utf16le(text);
        let payload = self.seal(&encoded).await?;
        self.handler
            .send(Package::data_with(DataType::String, payload))
    }

    pub(crate) fn send_package(&self, pkg: Package) -> Result<()> {
        self.handler.send(pkg)
    }

    // ------------------------------------------------------------------
    // Validation outside the handshake
    // ------------------------------------------------------------------

    /// Run a fresh probe-and-echo pass against this client.
    pub(crate) async fn validate(&self) -> Result<()> {
        let result = {
            let _serialized = self.panic_lock.lock().await;
            self.handler.pause_all().await;
            let aes = self.aes.read().await;
            let result = handshake::run_validation(
                &self.handler,
                aes.as_ref(),
                self.shared.settings.connection_test_tries,
                &self.cancel,
            )
            .await;
            drop(aes);
            if result.is_ok() {
                self.handler.resume_all();
            }
            result
        };
        if let Err(e) = &result {
            warn!(client = %self.id, error = %e, "validation pass failed");
            self.handle_pending_fault(Fault::IncorrectPackage).await;
        }
        result
    }

    /// Dispatch a disconnect and remove the session.
    pub(crate) async fn kick(&self) {
        self.handler.pause_dispatch().await;
        let _ = self
            .handler
            .dispatch(Package::internal(PackageType::Disconnect))
            .await;
        self.remove().await;
    }

    // ------------------------------------------------------------------
    // Fault policy
    // ------------------------------------------------------------------

    pub(crate) async fn handle_fault(&self, fault: Fault) {
        if self.removed.load(Ordering::Acquire) {
            return;
        }
        warn!(client = %self.id, %fault, "connection fault");
        if fault.is_terminal() {
            self.remove().await;
            return;
        }
        self.panic_rejoin(true).await;
    }

    /// Fault entry for paths that already paused the loops themselves.
    async fn handle_pending_fault(&self, fault: Fault) {
        if self.removed.load(Ordering::Acquire) {
            return;
        }
        if fault.is_terminal() {
            self.remove().await;
        } else {
            self.panic_rejoin(true).await;
        }
    }

    /// Pause, announce (unless the peer already did), and re-run the
    /// join. Success resumes the loops and fires the panic hook; failure
    /// or an exceeded panic cap removes the client.
    async fn panic_rejoin(&self, announce: bool) {
        let _serialized = self.panic_lock.lock().await;
        if self.removed.load(Ordering::Acquire) {
            return;
        }

        self.handler.pause_all().await;

        let panics = self.panic_count.fetch_add(1, Ordering::AcqRel) + 1;
        if panics > self.shared.settings.max_panics_per_client {
            warn!(client = %self.id, panics, "panic cap exceeded, disconnecting");
            let _ = self
                .handler
                .dispatch(Package::internal(PackageType::Disconnect))
                .await;
            self.remove().await;
            return;
        }

        if announce {
            if self
                .handler
                .dispatch(Package::internal(PackageType::Panic))
                .await
                .is_err()
            {
                self.remove().await;
                return;
            }
            handshake::panic_quiescence().await;
        }

        debug!(client = %self.id, panics, "running panic recovery join");
        let rejoin = with_deadline(
            JOIN_TIMEOUT,
            handshake::server_join(&self.handler, &self.shared.settings, &self.cancel),
        );
        match rejoin.await {
            Ok(aes) => {
                *self.aes.write().await = aes;
                self.handler.resume_all();
                self.shared.hooks.fire_client_panic(self.id);
                info!(client = %self.id, "panic recovery complete");
            }
            Err(e) => {
                warn!(client = %self.id, error = %e, "panic recovery failed");
                self.remove().await;
            }
        }
    }

    /// Tear the session down. Safe to call from inside a hook; fires the
    /// registry's disconnect hook at most once.
    async fn remove(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.liveness_cancel.cancel();
        self.handler.close().await;
        self.shared.remove_client(self.id).await;
    }

    // ------------------------------------------------------------------
    // Payload sealing
    // ------------------------------------------------------------------

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
impl PackageHooks for ServerSession {
    async fn on_internal(&self, pkg: Package) {
        match pkg.package_type {
            PackageType::Pong => self.flags.mark_pong(),
            PackageType::Ping => {
                // Answer symmetrically; clients normally never probe, but
                // the response is harmless.
                self.handler.pause_dispatch().await;
                let _ = self
                    .handler
                    .dispatch(Package::internal(PackageType::Pong))
                    .await;
                self.handler.resume_dispatch();
            }
            PackageType::DisconnectRequest => {
                let _ = self
                    .handler
                    .dispatch(Package::internal(PackageType::Disconnect))
                    .await;
                self.remove().await;
            }
            PackageType::Disconnect => {
                self.remove().await;
            }
            PackageType::Panic => {
                // The client hit a local fault and asks for a rejoin.
                self.panic_rejoin(false).await;
            }
            PackageType::None => {}
            _ => self.handle_fault(Fault::UnexpectedPackage).await,
        }
    }

    async fn on_data(&self, mut pkg: Package) {
        self.flags.mark_data();

        let payload = pkg.take_payload();
        let opened = match self.open(&payload).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(client = %self.id, error = %e, "data payload failed to decrypt");
                self.handle_fault(Fault::IncorrectPackage).await;
                return;
            }
        };

        match pkg.data_type {
            DataType::String => match decode_utf16le(&opened) {
                Ok(text) => self.shared.hooks.fire_string_received(self.id, text),
                Err(e) => {
                    warn!(client = %self.id, error = %e, "malformed string payload");
                    self.handle_fault(Fault::IncorrectPackage).await;
                }
            },
            // Byte-typed payloads surface through the blob hook.
            DataType::Byte | DataType::Blob | DataType::Empty => {
                self.shared.hooks.fire_blob_received(self.id, opened);
            }
        }
    }

    async fn on_error(&self, fault: Fault) {
        self.handle_fault(fault).await;
    }
}
