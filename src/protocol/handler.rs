//! Per-connection package engine.
//!
//! Two cooperating loops share one duplex socket: the *obtain* loop reads
//! frames and routes them to the hooks, the *dispatch* loop drains the
//! outgoing queue onto the wire. Both respect a manual-reset pause gate
//! and a 1-permit mutex around their half of the socket, so a caller that
//! pauses a loop is guaranteed no read or write is in flight once the
//! pause call returns, at which point it may drive the socket directly
//! through [`PackageHandler::dispatch`] and [`PackageHandler::obtain`],
//! which is how the handshake runs.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::core::package::{Package, PackageType};
use crate::core::stream::{PackageReader, PackageWriter};
use crate::error::{constants, Fault, Result, TransportError};

/// Hook contract between the loop engine and the layer above it.
///
/// `on_internal` is awaited by the obtain loop, so internal packages are
/// handled strictly in arrival order. `on_data` never blocks the loop:
/// data packages drain through a dedicated pump task, one at a time, in
/// arrival order. `on_error` receives exactly one fault per failed loop
/// iteration and must tolerate concurrent invocation; callers that
/// re-enter the protocol directly serialize via `pause_all` first.
#[async_trait]
pub trait PackageHooks: Send + Sync {
    async fn on_internal(&self, pkg: Package);
    async fn on_data(&self, pkg: Package);
    async fn on_error(&self, fault: Fault);
}

/// Manual-reset gate backed by a watch channel.
pub(crate) struct Gate {
    state: watch::Sender<bool>,
}

impl Gate {
    fn new() -> Self {
        let (state, _) = watch::channel(true);
        Self { state }
    }

    fn open(&self) {
        let _ = self.state.send(true);
    }

    fn close(&self) {
        let _ = self.state.send(false);
    }

    async fn wait_open(&self) {
        self.wait(true).await;
    }

    async fn wait_closed(&self) {
        self.wait(false).await;
    }

    async fn wait(&self, target: bool) {
        let mut rx = self.state.subscribe();
        loop {
            if *rx.borrow_and_update() == target {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

enum ReadStart {
    Stop,
    Paused,
    Tag(Result<u8>),
}

/// Concurrent obtain/dispatch engine for one connection.
pub struct PackageHandler {
    reader: Arc<Mutex<PackageReader>>,
    writer: Arc<Mutex<PackageWriter>>,
    queue_tx: mpsc::UnboundedSender<Package>,
    queue_rx: Arc<Mutex<mpsc::UnboundedReceiver<Package>>>,
    obtain_gate: Arc<Gate>,
    dispatch_gate: Arc<Gate>,
    obtain_cancel: CancellationToken,
    dispatch_cancel: CancellationToken,
    obtain_task: StdMutex<Option<JoinHandle<()>>>,
    dispatch_task: StdMutex<Option<JoinHandle<()>>>,
}

impl PackageHandler {
    /// Wrap a connected TCP stream.
    pub fn new(stream: TcpStream, receive_timeout: std::time::Duration) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self::from_parts(
            PackageReader::new(read_half, receive_timeout),
            PackageWriter::new(write_half),
        )
    }

    /// Wrap an already-split stream. Used by tests running over in-memory
    /// duplex pipes.
    pub fn from_parts(reader: PackageReader, writer: PackageWriter) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            obtain_gate: Arc::new(Gate::new()),
            dispatch_gate: Arc::new(Gate::new()),
            obtain_cancel: CancellationToken::new(),
            dispatch_cancel: CancellationToken::new(),
            obtain_task: StdMutex::new(None),
            dispatch_task: StdMutex::new(None),
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Enqueue a package for the dispatch loop. Returns immediately.
    pub fn send(&self, pkg: Package) -> Result<()> {
        self.queue_tx
            .send(pkg)
            .map_err(|_| TransportError::State(constants::ERR_HANDLER_CLOSED))
    }

    /// Enqueue a package and resolve once the dispatch loop has written
    /// its bytes. Replaces any completion notifier already attached.
    pub async fn send_await(&self, pkg: Package, cancel: &CancellationToken) -> Result<()> {
        let (pkg, written) = pkg.with_completion();
        self.send(pkg)?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = written => result.map_err(|_| TransportError::CannotWrite),
        }
    }

    /// Write a package directly, bypassing the queue. Only valid while
    /// the dispatch loop is paused or stopped.
    pub async fn dispatch(&self, mut pkg: Package) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_package(&pkg).await?;
        pkg.complete();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Read one package directly. Only valid while the obtain loop is
    /// paused or stopped.
    pub async fn obtain(&self, cancel: &CancellationToken) -> Result<Package> {
        let mut reader = self.reader.lock().await;
        reader.read_package(cancel).await
    }

    /// Read one package of the expected type. A received `None` package
    /// matches any expectation; an `Error` package always fails.
    pub async fn obtain_expected(
        &self,
        expected: PackageType,
        cancel: &CancellationToken,
    ) -> Result<Package> {
        self.obtain_any_of(&[expected], cancel).await
    }

    /// Read one package whose type is in the expected set. Expecting
    /// `None` (or nothing) accepts any type.
    pub async fn obtain_any_of(
        &self,
        expected: &[PackageType],
        cancel: &CancellationToken,
    ) -> Result<Package> {
        let pkg = self.obtain(cancel).await?;
        let accepted = pkg.package_type == PackageType::None
            || expected.is_empty()
            || expected.contains(&PackageType::None)
            || expected.contains(&pkg.package_type);
        if accepted {
            Ok(pkg)
        } else {
            Err(TransportError::UnexpectedPackage {
                got: pkg.package_type,
            })
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Spawn both loops. Idempotent; later calls are no-ops.
    pub fn start_all(&self, hooks: Arc<dyn PackageHooks>) {
        self.start_obtain(Arc::clone(&hooks));
        self.start_dispatch(hooks);
    }

    fn start_obtain(&self, hooks: Arc<dyn PackageHooks>) {
        let Ok(mut slot) = self.obtain_task.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }

        // Data packages flow through a dedicated pump task so the loop
        // never awaits `on_data` while delivery order stays intact. The
        // pump ends when the loop drops its sender.
        let (data_tx, mut data_rx) = mpsc::unbounded_channel::<Package>();
        let pump_hooks = Arc::clone(&hooks);
        tokio::spawn(async move {
            while let Some(pkg) = data_rx.recv().await {
                pump_hooks.on_data(pkg).await;
            }
        });

        *slot = Some(tokio::spawn(Self::obtain_loop(
            Arc::clone(&self.reader),
            Arc::clone(&self.obtain_gate),
            self.obtain_cancel.clone(),
            hooks,
            data_tx,
        )));
    }

    fn start_dispatch(&self, hooks: Arc<dyn PackageHooks>) {
        let Ok(mut slot) = self.dispatch_task.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }
        *slot = Some(tokio::spawn(Self::dispatch_loop(
            Arc::clone(&self.writer),
            Arc::clone(&self.queue_rx),
            Arc::clone(&self.dispatch_gate),
            self.dispatch_cancel.clone(),
            hooks,
        )));
    }

    /// Close the obtain gate and wait out any in-flight read.
    pub async fn pause_obtain(&self) {
        self.obtain_gate.close();
        let _quiesced = self.reader.lock().await;
    }

    /// Close the dispatch gate and wait out any in-flight write.
    pub async fn pause_dispatch(&self) {
        self.dispatch_gate.close();
        let _quiesced = self.writer.lock().await;
    }

    /// Pause both loops. After this returns, no read or write occurs
    /// until a resume (or stop), and none is in flight.
    pub async fn pause_all(&self) {
        self.pause_obtain().await;
        self.pause_dispatch().await;
    }

    pub fn resume_obtain(&self) {
        self.obtain_gate.open();
    }

    pub fn resume_dispatch(&self) {
        self.dispatch_gate.open();
    }

    pub fn resume_all(&self) {
        self.resume_obtain();
        self.resume_dispatch();
    }

    /// Cancel the obtain loop and await its task.
    pub async fn stop_obtain(&self) {
        self.obtain_cancel.cancel();
        let task = self.obtain_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Cancel the dispatch loop and await its task.
    pub async fn stop_dispatch(&self) {
        self.dispatch_cancel.cancel();
        let task = self
            .dispatch_task
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Stop both loops and await their tasks. Pending queue entries stay
    /// queued.
    pub async fn stop_all(&self) {
        self.stop_obtain().await;
        self.stop_dispatch().await;
    }

    /// Stop both loops, then drain the outgoing queue onto the wire,
    /// aborting the drain at the first write failure.
    pub async fn stop_and_dispatch_rest(&self) {
        self.stop_all().await;
        let mut queue = self.queue_rx.lock().await;
        let mut writer = self.writer.lock().await;
        while let Ok(mut pkg) = queue.try_recv() {
            if writer.write_package(&pkg).await.is_err() {
                debug!("queue drain aborted on write failure");
                break;
            }
            pkg.complete();
        }
    }

    /// Cancel everything and shut the socket down. Does not await the
    /// loop tasks, so it is safe to call from inside a hook.
    pub async fn close(&self) {
        self.obtain_cancel.cancel();
        self.dispatch_cancel.cancel();
        let mut writer = self.writer.lock().await;
        writer.shutdown().await;
    }

    // ------------------------------------------------------------------
    // Loops
    // ------------------------------------------------------------------

    async fn obtain_loop(
        reader: Arc<Mutex<PackageReader>>,
        gate: Arc<Gate>,
        cancel: CancellationToken,
        hooks: Arc<dyn PackageHooks>,
        data_tx: mpsc::UnboundedSender<Package>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = gate.wait_open() => {}
            }

            let result = {
                let mut reader = reader.lock().await;
                // Racing the first byte against a pause request is safe:
                // nothing has been consumed while the read is pending.
                // Once the tag is in, the rest of the frame is completed
                // under the receive timeout even if a pause arrives.
                let start = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => ReadStart::Stop,
                    _ = gate.wait_closed() => ReadStart::Paused,
                    tag = reader.read_tag() => ReadStart::Tag(tag),
                };
                match start {
                    ReadStart::Stop => break,
                    ReadStart::Paused => continue,
                    ReadStart::Tag(Ok(tag)) => reader.read_body(tag).await,
                    ReadStart::Tag(Err(e)) => Err(e),
                }
            };

            match result {
                Ok(pkg) if pkg.is_internal() => {
                    trace!(package_type = ?pkg.package_type, "internal package");
                    hooks.on_internal(pkg).await;
                }
                Ok(pkg) => {
                    trace!(len = pkg.payload_len(), "data package");
                    let _ = data_tx.send(pkg);
                }
                Err(TransportError::Cancelled) => break,
                Err(e) => match e.as_fault() {
                    Some(fault) => hooks.on_error(fault).await,
                    None => warn!(error = %e, "unmapped obtain failure"),
                },
            }
        }
        debug!("obtain loop ended");
    }

    async fn dispatch_loop(
        writer: Arc<Mutex<PackageWriter>>,
        queue: Arc<Mutex<mpsc::UnboundedReceiver<Package>>>,
        gate: Arc<Gate>,
        cancel: CancellationToken,
        hooks: Arc<dyn PackageHooks>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = gate.wait_open() => {}
            }

            let mut pkg = {
                let mut queue = queue.lock().await;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    pkg = queue.recv() => match pkg {
                        Some(pkg) => pkg,
                        None => break,
                    },
                }
            };

            // The gate may have closed while this task waited on the
            // queue; nothing may hit the wire until it reopens.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = gate.wait_open() => {}
            }

            let result = {
                let mut writer = writer.lock().await;
                writer.write_package(&pkg).await
            };
            match result {
                Ok(()) => pkg.complete(),
                Err(_) => hooks.on_error(Fault::CannotWrite).await,
            }
        }
        debug!("dispatch loop ended");
    }
}
