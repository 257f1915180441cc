// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The gateway control-plane server: listener lifecycle, frame dispatch
//! and outbound invocation toward the single management client.

use crate::bundle::CertificateBundle;
use crate::error::InvokeError;
use crate::error::StartError;
use crate::provision;
use crate::settings::GatewaySettings;
use crate::transport::ClientId;
use crate::transport::ServerParams;
use crate::transport::TlsPolicy;
use crate::transport::Transport;
use crate::transport::TransportEvent;
use async_trait::async_trait;
use gateway_rpc::dispatch::DispatcherFactory;
use gateway_rpc::dispatch::Invoker;
use gateway_rpc::dispatch::MethodDispatcher;
use gateway_rpc::frame::FrameAssembler;
use gateway_rpc::frame::FrameKind;
use gateway_rpc::frame::WireProtocol;
use gateway_rpc::RpcError;
use gateway_rpc::RpcResult;
use gateway_rpc::RpcValue;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use slog::Logger;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

// Depth of the transport event channel. The protocol has exactly one
// client, so the transport blocks rather than buffering unboundedly once
// this many events are queued.
const EVENT_CHANNEL_DEPTH: usize = 32;

/// The only method reachable before the gateway has been provisioned.
const CONFIGURE_METHOD: &str = "configure";

/// Observable cadence of the bounded wait inside [`GatewayServer::invoke`].
///
/// The total maximum wait is `wake_interval * max_wake_count`; a stopped
/// server unblocks a waiting invocation at the next wake-up.
#[derive(Debug, Clone, Copy)]
pub struct InvokeRetryConfig {
    /// Interval between wake-ups while waiting for the client's response.
    pub wake_interval: Duration,

    /// Number of wake-ups before the invocation gives up.
    pub max_wake_count: usize,
}

impl Default for InvokeRetryConfig {
    fn default() -> Self {
        Self {
            wake_interval: Duration::from_millis(1000),
            max_wake_count: 10,
        }
    }
}

/// Operating mode, decided by certificate-bundle resolution at `start()`
/// and fixed for the lifetime of that listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayMode {
    /// TLS material is incomplete. Only the bootstrap `configure` method is
    /// reachable, on the bootstrap port, without TLS enforcement.
    Unconfigured,

    /// Mutual TLS is enforced on the service port and the full family
    /// method surface is exposed.
    Configured,
}

#[derive(Debug, Default)]
struct PendingInvocation {
    response: Option<RpcResult>,
    waiting: bool,
}

/// State shared between the public handle, the dispatch task and invoke
/// callers.
struct Shared {
    stopped: AtomicBool,
    mode: StdMutex<GatewayMode>,
    client: StdMutex<Option<ClientId>>,
    /// Serializes outbound calls; responses are correlated by arrival order
    /// alone, so only one may be on the wire at a time.
    invoke_lock: TokioMutex<()>,
    pending: StdMutex<PendingInvocation>,
    response_notify: Notify,
}

struct Running {
    dispatcher: Arc<dyn MethodDispatcher>,
    events_task: JoinHandle<()>,
}

/// Control-plane RPC server for a single management client.
///
/// `start()` resolves the certificate bundle and opens the listener in the
/// resulting mode; a successful bootstrap `configure` call schedules a
/// restart that re-resolves the bundle and comes back up with mutual TLS.
/// While configured, inbound requests go to the family dispatcher and
/// [`invoke`](Self::invoke) issues calls in the other direction.
pub struct GatewayServer<T, P> {
    settings: Arc<GatewaySettings>,
    transport: Arc<T>,
    protocol: Arc<P>,
    factory: Arc<dyn DispatcherFactory>,
    retry_config: InvokeRetryConfig,
    shared: Arc<Shared>,
    running: TokioMutex<Option<Running>>,
    restart_task: TokioMutex<Option<JoinHandle<()>>>,
    weak: Weak<Self>,
    log: Logger,
}

impl<T, P> Drop for GatewayServer<T, P> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.try_lock() {
            if let Some(running) = running.take() {
                running.events_task.abort();
            }
        }
        if let Ok(mut restart) = self.restart_task.try_lock() {
            if let Some(task) = restart.take() {
                task.abort();
            }
        }
    }
}

impl<T: Transport, P: WireProtocol> GatewayServer<T, P> {
    pub fn new(
        settings: GatewaySettings,
        transport: Arc<T>,
        protocol: Arc<P>,
        factory: Arc<dyn DispatcherFactory>,
        log: Logger,
    ) -> Arc<Self> {
        Self::with_retry_config(
            settings,
            transport,
            protocol,
            factory,
            InvokeRetryConfig::default(),
            log,
        )
    }

    pub fn with_retry_config(
        settings: GatewaySettings,
        transport: Arc<T>,
        protocol: Arc<P>,
        factory: Arc<dyn DispatcherFactory>,
        retry_config: InvokeRetryConfig,
        log: Logger,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            settings: Arc::new(settings),
            transport,
            protocol,
            factory,
            retry_config,
            shared: Arc::new(Shared {
                stopped: AtomicBool::new(true),
                mode: StdMutex::new(GatewayMode::Unconfigured),
                client: StdMutex::new(None),
                invoke_lock: TokioMutex::new(()),
                pending: StdMutex::new(PendingInvocation::default()),
                response_notify: Notify::new(),
            }),
            running: TokioMutex::new(None),
            restart_task: TokioMutex::new(None),
            weak: weak.clone(),
            log,
        })
    }

    /// Mode decided by the most recent `start()`.
    pub fn mode(&self) -> GatewayMode {
        *self.shared.mode.lock().unwrap()
    }

    /// Numeric id of the running family dispatcher, if any.
    pub async fn family_id(&self) -> Option<i32> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.dispatcher.family_id())
    }

    /// Resolves the certificate bundle, builds the family dispatcher and
    /// opens the listener in the resulting mode. Any failure leaves the
    /// server stopped with no listener open.
    pub async fn start(&self) -> Result<(), StartError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(StartError::AlreadyRunning);
        }

        if self.settings.family.is_empty() {
            error!(self.log, "setting `family` is empty");
            return Err(StartError::EmptyFamily);
        }

        let invoker: Arc<dyn Invoker> = Arc::new(self.invoke_handle());
        let dispatcher =
            match self.factory.create(&self.settings.family, invoker) {
                Some(dispatcher) => dispatcher,
                None => {
                    error!(
                        self.log, "unknown family";
                        "family" => %self.settings.family,
                    );
                    return Err(StartError::UnknownFamily(
                        self.settings.family.clone(),
                    ));
                }
            };

        let bundle = CertificateBundle::resolve(&self.settings);
        let mode = if bundle.is_complete() {
            GatewayMode::Configured
        } else {
            GatewayMode::Unconfigured
        };

        if mode == GatewayMode::Unconfigured
            && self.settings.configuration_password.is_empty()
        {
            error!(
                self.log,
                "gateway is unconfigured but `configurationPassword` \
                 is not set"
            );
            return Err(StartError::MissingConfigurationPassword);
        }

        let (port, tls) = match mode {
            GatewayMode::Configured => (
                self.settings.port,
                TlsPolicy {
                    enabled: true,
                    require_client_cert: true,
                    ca_file: bundle.ca().map(|path| path.to_path_buf()),
                    cert_file: bundle.cert().map(|path| path.to_path_buf()),
                    key_file: bundle.key().map(|path| path.to_path_buf()),
                    dh_param_file: Some(bundle.dh_params().to_path_buf()),
                },
            ),
            GatewayMode::Unconfigured => {
                warn!(self.log, "gateway is not fully configured yet");
                (self.settings.port_unconfigured, TlsPolicy::default())
            }
        };
        let params = ServerParams {
            listen_address: self.settings.listen_address.clone(),
            port,
            max_connections: 1,
            tls,
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let bound = match self.transport.start_server(params, events_tx).await
        {
            Ok(bound) => bound,
            Err(err) => {
                error!(self.log, "failed to start listener"; "err" => %err);
                return Err(err.into());
            }
        };

        *self.shared.mode.lock().unwrap() = mode;
        *self.shared.client.lock().unwrap() = None;
        *self.shared.pending.lock().unwrap() = PendingInvocation::default();
        self.shared.stopped.store(false, Ordering::SeqCst);

        let inner = Inner {
            mode,
            settings: Arc::clone(&self.settings),
            transport: Arc::clone(&self.transport),
            protocol: Arc::clone(&self.protocol),
            assembler: self.protocol.assembler(),
            dispatcher: Arc::clone(&dispatcher),
            shared: Arc::clone(&self.shared),
            server: self.weak.clone(),
            events: events_rx,
            log: self.log.clone(),
        };
        let events_task = spawn_event_task(inner);

        info!(
            self.log, "listener started";
            "address" => bound,
            "mode" => ?mode,
        );

        *running = Some(Running { dispatcher, events_task });
        Ok(())
    }

    /// Stops the listener and releases the family dispatcher. Safe to call
    /// when already stopped; a blocked `invoke()` observes the stopped flag
    /// within one wake interval.
    pub async fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);

        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        self.transport.stop_server().await;
        self.transport.wait_for_server_stopped().await;

        // The transport dropped its event sender; the dispatch task drains
        // the channel and exits.
        if let Err(err) = running.events_task.await {
            error!(self.log, "dispatch task failed"; "err" => %err);
        }
    }

    /// Stops the server and starts it again, re-resolving the certificate
    /// bundle. A start failure leaves the server stopped and is logged.
    pub async fn restart(&self) {
        info!(self.log, "restarting server");
        self.stop().await;
        if let Err(err) = self.start().await {
            error!(self.log, "failed to restart server"; "err" => %err);
        }
    }

    /// Queues a restart on a detached task, off whatever context noticed
    /// the need for one. A new request waits for any prior restart to
    /// finish before beginning its own stop/start cycle.
    pub async fn schedule_restart(&self) {
        let Some(server) = self.weak.upgrade() else {
            return;
        };
        let mut slot = self.restart_task.lock().await;
        let previous = slot.take();
        *slot = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            server.restart().await;
        }));
    }

    /// Calls `method` on the connected management client and waits for its
    /// response, bounded by the configured wake cadence.
    pub async fn invoke(
        &self,
        method: &str,
        params: &[RpcValue],
    ) -> Result<RpcValue, InvokeError> {
        self.invoke_handle().call(method, params).await
    }

    fn invoke_handle(&self) -> InvokeHandle<T, P> {
        InvokeHandle {
            shared: Arc::clone(&self.shared),
            transport: Arc::clone(&self.transport),
            protocol: Arc::clone(&self.protocol),
            retry_config: self.retry_config,
            log: self.log.clone(),
        }
    }
}

/// Spawns the per-listener dispatch task. Kept out of [`GatewayServer::start`]
/// so that `start`'s own future does not register the dispatch task's hidden
/// opaque type, which the compiler cannot otherwise reveal when `start` is
/// itself reached through the detached restart task's `tokio::spawn`.
fn spawn_event_task<T: Transport, P: WireProtocol>(
    inner: Inner<T, P>,
) -> JoinHandle<()> {
    tokio::spawn(inner.run())
}

/// Outbound invocation engine, also handed to the family dispatcher as its
/// [`Invoker`].
struct InvokeHandle<T, P> {
    shared: Arc<Shared>,
    transport: Arc<T>,
    protocol: Arc<P>,
    retry_config: InvokeRetryConfig,
    log: Logger,
}

impl<T: Transport, P: WireProtocol> InvokeHandle<T, P> {
    async fn call(
        &self,
        method: &str,
        params: &[RpcValue],
    ) -> Result<RpcValue, InvokeError> {
        if *self.shared.mode.lock().unwrap() != GatewayMode::Configured
            || self.transport.client_count() == 0
        {
            return Err(InvokeError::NoClientConnected);
        }

        let _serialized = self.shared.invoke_lock.lock().await;

        let client = match *self.shared.client.lock().unwrap() {
            Some(client) => client,
            None => return Err(InvokeError::NoClientConnected),
        };

        {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.response = None;
            pending.waiting = true;
        }

        let result = self.send_and_wait(client, method, params).await;
        self.shared.pending.lock().unwrap().waiting = false;
        result
    }

    async fn send_and_wait(
        &self,
        client: ClientId,
        method: &str,
        params: &[RpcValue],
    ) -> Result<RpcValue, InvokeError> {
        let frame = self.protocol.encode_request(method, params);
        if let Err(err) =
            self.transport.send_to_client(client, frame, false).await
        {
            error!(
                self.log, "failed to send request";
                "method" => %method,
                "err" => %err,
            );
            return Err(err.into());
        }

        for _ in 0..self.retry_config.max_wake_count {
            if let Some(response) = self.take_response() {
                return response.map_err(InvokeError::Fault);
            }
            if self.shared.stopped.load(Ordering::SeqCst) {
                return Err(InvokeError::NoResponse);
            }
            let _ = tokio::time::timeout(
                self.retry_config.wake_interval,
                self.shared.response_notify.notified(),
            )
            .await;
        }

        // The response may have landed during the final wake interval.
        if let Some(response) = self.take_response() {
            return response.map_err(InvokeError::Fault);
        }
        Err(InvokeError::NoResponse)
    }

    fn take_response(&self) -> Option<RpcResult> {
        self.shared.pending.lock().unwrap().response.take()
    }
}

#[async_trait]
impl<T: Transport, P: WireProtocol> Invoker for InvokeHandle<T, P> {
    async fn invoke(&self, method: &str, params: Vec<RpcValue>) -> RpcResult {
        match self.call(method, &params).await {
            Ok(value) => Ok(value),
            Err(InvokeError::Fault(fault)) => Err(fault),
            Err(err) => {
                warn!(
                    self.log, "outbound invocation failed";
                    "method" => %method,
                    "err" => %err,
                );
                Err(err.into_fault())
            }
        }
    }
}

/// The dispatch task for one listener: consumes transport events,
/// re-assembles frames and routes them by direction and mode.
struct Inner<T, P: WireProtocol> {
    mode: GatewayMode,
    settings: Arc<GatewaySettings>,
    transport: Arc<T>,
    protocol: Arc<P>,
    assembler: P::Assembler,
    dispatcher: Arc<dyn MethodDispatcher>,
    shared: Arc<Shared>,
    server: Weak<GatewayServer<T, P>>,
    events: mpsc::Receiver<TransportEvent>,
    log: Logger,
}

impl<T: Transport, P: WireProtocol> Inner<T, P> {
    async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                TransportEvent::Connected { client, address, port } => {
                    info!(
                        self.log, "new connection";
                        "address" => %address,
                        "port" => port,
                    );
                    *self.shared.client.lock().unwrap() = Some(client);
                }
                TransportEvent::Packet { client, data } => {
                    self.packet_received(client, &data).await;
                }
            }
        }
        debug!(self.log, "event channel closed; exiting dispatch task");
    }

    /// Feeds a delivered packet to the frame assembler. A packet may hold
    /// several frames or a partial one; the assembler state is reset after
    /// every completed frame and on every error, so one bad frame cannot
    /// poison the ones that follow.
    async fn packet_received(&mut self, client: ClientId, data: &[u8]) {
        let mut processed = 0;
        while processed < data.len() {
            match self.assembler.feed(&data[processed..]) {
                Ok(used) => processed += used,
                Err(err) => {
                    self.assembler.reset();
                    error!(
                        self.log, "error processing packet";
                        "err" => %err,
                    );
                    return;
                }
            }

            if !self.assembler.is_complete() {
                continue;
            }
            let kind = self.assembler.kind();
            let frame = self.assembler.take_frame();
            self.assembler.reset();

            match kind {
                Some(FrameKind::Request) => {
                    self.handle_request(client, &frame).await;
                }
                Some(FrameKind::Response) => self.handle_response(&frame),
                None => {
                    error!(self.log, "completed frame has no direction");
                }
            }
        }
    }

    async fn handle_request(&mut self, client: ClientId, frame: &[u8]) {
        let (method, params) = match self.protocol.decode_request(frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                error!(self.log, "failed to decode request"; "err" => %err);
                return;
            }
        };

        match self.mode {
            GatewayMode::Unconfigured => {
                self.handle_bootstrap_request(client, &method, &params).await;
            }
            GatewayMode::Configured => {
                self.dispatch_request(client, method, params);
            }
        }
    }

    /// The only method reachable before provisioning is `configure`; the
    /// response closes the bootstrap connection either way. A successful
    /// call schedules the restart that brings the listener back up with
    /// mutual TLS.
    async fn handle_bootstrap_request(
        &mut self,
        client: ClientId,
        method: &str,
        params: &[RpcValue],
    ) {
        if method != CONFIGURE_METHOD {
            warn!(
                self.log, "unknown bootstrap method";
                "method" => %method,
            );
            let fault = Err(RpcError::new(-1, "Unknown method."));
            self.send_response(client, &fault, true).await;
            return;
        }

        let response = provision::configure(
            &self.settings,
            self.protocol.as_ref(),
            params,
            &self.log,
        )
        .await;
        let provisioned = response.is_ok();
        self.send_response(client, &response, true).await;

        if provisioned {
            match self.server.upgrade() {
                Some(server) => server.schedule_restart().await,
                None => {
                    warn!(self.log, "server handle gone; skipping restart");
                }
            }
        }
    }

    /// Forwards a request to the family dispatcher on a detached task: the
    /// dispatcher may invoke back into the client, and that response can
    /// only arrive through this task's event loop.
    fn dispatch_request(
        &self,
        client: ClientId,
        method: String,
        params: Vec<RpcValue>,
    ) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let transport = Arc::clone(&self.transport);
        let protocol = Arc::clone(&self.protocol);
        let log = self.log.clone();
        tokio::spawn(async move {
            let response = dispatcher.call_method(&method, params).await;
            let frame = protocol.encode_response(&response);
            if let Err(err) =
                transport.send_to_client(client, frame, false).await
            {
                error!(
                    log, "failed to send response";
                    "method" => %method,
                    "err" => %err,
                );
            }
        });
    }

    fn handle_response(&self, frame: &[u8]) {
        if self.mode != GatewayMode::Configured {
            return;
        }
        if !self.shared.pending.lock().unwrap().waiting {
            debug!(self.log, "ignoring unsolicited response frame");
            return;
        }

        match self.protocol.decode_response(frame) {
            Ok(response) => {
                self.shared.pending.lock().unwrap().response = Some(response);
                self.shared.response_notify.notify_waiters();
            }
            Err(err) => {
                error!(self.log, "failed to decode response"; "err" => %err);
            }
        }
    }

    async fn send_response(
        &mut self,
        client: ClientId,
        response: &RpcResult,
        close_after_send: bool,
    ) {
        let frame = self.protocol.encode_response(response);
        if let Err(err) = self
            .transport
            .send_to_client(client, frame, close_after_send)
            .await
        {
            error!(
                self.log, "failed to send response";
                "client" => client,
                "err" => %err,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::decode_request_frame;
    use crate::test_support::decode_response_frame;
    use crate::test_support::discard_logger;
    use crate::test_support::encrypt_provisioning_payload;
    use crate::test_support::frame_bytes;
    use crate::test_support::provisioning_plaintext;
    use crate::test_support::FakeFamilyFactory;
    use crate::test_support::FakeTransport;
    use crate::test_support::SentFrame;
    use crate::test_support::TestProtocol;
    use camino::Utf8Path;
    use camino_tempfile::Utf8TempDir;
    use std::fs;
    use std::time::Instant;

    const CLIENT: ClientId = 7;

    struct Harness {
        server: Arc<GatewayServer<FakeTransport, TestProtocol>>,
        transport: Arc<FakeTransport>,
        sent: mpsc::UnboundedReceiver<SentFrame>,
        factory: Arc<FakeFamilyFactory>,
        dir: Utf8TempDir,
    }

    fn settings_for(
        dir: &Utf8Path,
        family: &str,
        password: &str,
    ) -> GatewaySettings {
        serde_json::from_value(serde_json::json!({
            "family": family,
            "dataPath": dir,
            "configurationPassword": password,
        }))
        .unwrap()
    }

    fn harness_with_family(
        family: &str,
        password: &str,
        retry_config: InvokeRetryConfig,
    ) -> Harness {
        let dir = Utf8TempDir::new().unwrap();
        let settings = settings_for(dir.path(), family, password);
        let (transport, sent) = FakeTransport::new();
        let factory = Arc::new(FakeFamilyFactory::default());
        let server = GatewayServer::with_retry_config(
            settings,
            Arc::clone(&transport),
            Arc::new(TestProtocol),
            Arc::clone(&factory) as Arc<dyn DispatcherFactory>,
            retry_config,
            discard_logger(),
        );
        Harness { server, transport, sent, factory, dir }
    }

    fn harness(password: &str, retry_config: InvokeRetryConfig) -> Harness {
        harness_with_family("enocean", password, retry_config)
    }

    fn write_bundle(dir: &Utf8Path) {
        for name in ["ca.crt", "gateway.crt", "gateway.key"] {
            fs::write(dir.join(name), format!("pem {name}")).unwrap();
        }
    }

    async fn recv_frame(
        sent: &mut mpsc::UnboundedReceiver<SentFrame>,
    ) -> SentFrame {
        tokio::time::timeout(Duration::from_secs(5), sent.recv())
            .await
            .expect("timed out waiting for a sent frame")
            .expect("sent-frame channel closed")
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn connect(harness: &Harness) {
        harness.transport.connect_client(CLIENT).await;
        let shared = Arc::clone(&harness.server.shared);
        wait_for(move || shared.client.lock().unwrap().is_some()).await;
    }

    fn bundle_payload(password: &str) -> String {
        encrypt_provisioning_payload(
            password,
            &provisioning_plaintext(&[
                ("caCert", "ca pem"),
                ("gatewayCert", "cert pem"),
                ("gatewayKey", "key pem"),
            ]),
        )
    }

    #[tokio::test]
    async fn complete_bundle_starts_configured_with_mutual_tls() {
        let h = harness("secret", InvokeRetryConfig::default());
        write_bundle(h.dir.path());
        h.server.start().await.unwrap();

        let starts = h.transport.starts();
        assert_eq!(starts.len(), 1);
        let params = &starts[0];
        assert_eq!(params.port, 2017);
        assert_eq!(params.max_connections, 1);
        assert!(params.tls.enabled);
        assert!(params.tls.require_client_cert);
        assert_eq!(
            params.tls.ca_file.as_deref(),
            Some(h.dir.path().join("ca.crt").as_path())
        );
        assert_eq!(
            params.tls.key_file.as_deref(),
            Some(h.dir.path().join("gateway.key").as_path())
        );
        assert!(params.tls.dh_param_file.is_some());
        assert_eq!(h.server.mode(), GatewayMode::Configured);
        assert_eq!(h.server.family_id().await, Some(42));
    }

    #[tokio::test]
    async fn missing_certificate_starts_unconfigured_on_bootstrap_port() {
        let h = harness("secret", InvokeRetryConfig::default());
        // CA and certificate only; the key is missing.
        fs::write(h.dir.path().join("ca.crt"), "pem").unwrap();
        fs::write(h.dir.path().join("gateway.crt"), "pem").unwrap();
        h.server.start().await.unwrap();

        let starts = h.transport.starts();
        assert_eq!(starts.len(), 1);
        let params = &starts[0];
        assert_eq!(params.port, 2018);
        assert!(!params.tls.enabled);
        assert!(!params.tls.require_client_cert);
        assert_eq!(h.server.mode(), GatewayMode::Unconfigured);
    }

    #[tokio::test]
    async fn unconfigured_without_password_fails_closed() {
        let h = harness("", InvokeRetryConfig::default());
        let err = h.server.start().await.unwrap_err();
        assert!(matches!(err, StartError::MissingConfigurationPassword));
        assert!(h.transport.starts().is_empty());
        assert!(!h.transport.is_running());
        assert_eq!(h.server.family_id().await, None);
    }

    #[tokio::test]
    async fn empty_and_unknown_families_fail_start() {
        let h = harness_with_family("", "secret", InvokeRetryConfig::default());
        assert!(matches!(
            h.server.start().await.unwrap_err(),
            StartError::EmptyFamily
        ));
        assert!(h.transport.starts().is_empty());

        let h = harness_with_family(
            "zigbee",
            "secret",
            InvokeRetryConfig::default(),
        );
        assert!(matches!(
            h.server.start().await.unwrap_err(),
            StartError::UnknownFamily(family) if family == "zigbee"
        ));
        assert!(h.transport.starts().is_empty());
    }

    #[tokio::test]
    async fn start_twice_reports_already_running() {
        let h = harness("secret", InvokeRetryConfig::default());
        write_bundle(h.dir.path());
        h.server.start().await.unwrap();
        assert!(matches!(
            h.server.start().await.unwrap_err(),
            StartError::AlreadyRunning
        ));
        assert_eq!(h.transport.starts().len(), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let h = harness("secret", InvokeRetryConfig::default());
        write_bundle(h.dir.path());
        h.server.stop().await;
        h.server.start().await.unwrap();
        h.server.stop().await;
        h.server.stop().await;
        assert!(!h.transport.is_running());
        assert_eq!(h.server.family_id().await, None);
    }

    #[tokio::test]
    async fn bootstrap_mode_rejects_unknown_methods() {
        let mut h = harness("secret", InvokeRetryConfig::default());
        h.server.start().await.unwrap();
        connect(&h).await;

        h.transport
            .push_event(TransportEvent::Packet {
                client: CLIENT,
                data: TestProtocol.encode_request("deviceInfo", &[]),
            })
            .await;

        let sent = recv_frame(&mut h.sent).await;
        assert!(sent.close_after_send);
        assert_eq!(
            decode_response_frame(&sent.data),
            Err(RpcError::new(-1, "Unknown method."))
        );
        // The family dispatcher exists but is unreachable in this mode.
        let created = h.factory.created.lock().unwrap();
        assert!(created[0].calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn frame_split_across_packets_dispatches_once() {
        let mut h = harness("secret", InvokeRetryConfig::default());
        h.server.start().await.unwrap();
        connect(&h).await;

        let frame = TestProtocol.encode_request("deviceInfo", &[]);
        let (first, second) = frame.split_at(3);
        h.transport
            .push_event(TransportEvent::Packet {
                client: CLIENT,
                data: first.to_vec(),
            })
            .await;
        h.transport
            .push_event(TransportEvent::Packet {
                client: CLIENT,
                data: second.to_vec(),
            })
            .await;

        let sent = recv_frame(&mut h.sent).await;
        assert_eq!(
            decode_response_frame(&sent.data),
            Err(RpcError::new(-1, "Unknown method."))
        );
        // Exactly one dispatch: nothing else was sent.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_frame_is_discarded_and_stream_recovers() {
        let mut h = harness("secret", InvokeRetryConfig::default());
        h.server.start().await.unwrap();
        connect(&h).await;

        h.transport
            .push_event(TransportEvent::Packet {
                client: CLIENT,
                data: frame_bytes(9, b"junk"),
            })
            .await;
        h.transport
            .push_event(TransportEvent::Packet {
                client: CLIENT,
                data: TestProtocol.encode_request("deviceInfo", &[]),
            })
            .await;

        let sent = recv_frame(&mut h.sent).await;
        assert_eq!(
            decode_response_frame(&sent.data),
            Err(RpcError::new(-1, "Unknown method."))
        );
    }

    #[tokio::test]
    async fn successful_configure_restarts_into_configured_mode() {
        let mut h = harness("secret", InvokeRetryConfig::default());
        h.server.start().await.unwrap();
        connect(&h).await;

        h.transport
            .push_event(TransportEvent::Packet {
                client: CLIENT,
                data: TestProtocol.encode_request(
                    "configure",
                    &[RpcValue::from(bundle_payload("secret"))],
                ),
            })
            .await;

        // The response goes out (closing the bootstrap connection) before
        // the detached restart brings the listener back up.
        let sent = recv_frame(&mut h.sent).await;
        assert!(sent.close_after_send);
        assert_eq!(decode_response_frame(&sent.data), Ok(RpcValue::Void));

        let transport = Arc::clone(&h.transport);
        wait_for(move || transport.starts().len() == 2).await;
        let server = Arc::clone(&h.server);
        wait_for(move || server.mode() == GatewayMode::Configured).await;
        let starts = h.transport.starts();
        assert_eq!(starts[1].port, 2017);
        assert!(starts[1].tls.enabled);
        assert!(starts[1].tls.require_client_cert);

        assert_eq!(
            fs::read_to_string(h.dir.path().join("ca.crt")).unwrap(),
            "ca pem"
        );
        assert_eq!(
            fs::read_to_string(h.dir.path().join("gateway.crt")).unwrap(),
            "cert pem"
        );
        assert_eq!(
            fs::read_to_string(h.dir.path().join("gateway.key")).unwrap(),
            "key pem"
        );
    }

    #[tokio::test]
    async fn failed_configure_does_not_restart() {
        let mut h = harness("secret", InvokeRetryConfig::default());
        h.server.start().await.unwrap();
        connect(&h).await;

        h.transport
            .push_event(TransportEvent::Packet {
                client: CLIENT,
                data: TestProtocol.encode_request(
                    "configure",
                    &[RpcValue::from(bundle_payload("wrong password"))],
                ),
            })
            .await;

        let sent = recv_frame(&mut h.sent).await;
        assert_eq!(
            decode_response_frame(&sent.data),
            Err(RpcError::new(-2, "Data is invalid."))
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.transport.starts().len(), 1);
        assert_eq!(h.server.mode(), GatewayMode::Unconfigured);
    }

    #[tokio::test]
    async fn configured_mode_forwards_requests_to_the_family() {
        let mut h = harness("secret", InvokeRetryConfig::default());
        write_bundle(h.dir.path());
        h.server.start().await.unwrap();
        connect(&h).await;

        h.transport
            .push_event(TransportEvent::Packet {
                client: CLIENT,
                data: TestProtocol
                    .encode_request("deviceInfo", &[RpcValue::Integer(3)]),
            })
            .await;

        let sent = recv_frame(&mut h.sent).await;
        assert!(!sent.close_after_send);
        assert_eq!(
            decode_response_frame(&sent.data),
            Ok(RpcValue::from("dispatched"))
        );
        let created = h.factory.created.lock().unwrap();
        assert_eq!(
            created[0].calls.lock().unwrap().as_slice(),
            &[("deviceInfo".to_string(), vec![RpcValue::Integer(3)])]
        );
    }

    #[tokio::test]
    async fn invoke_without_client_fails_immediately() {
        let h = harness("secret", InvokeRetryConfig::default());
        write_bundle(h.dir.path());
        h.server.start().await.unwrap();

        let started = Instant::now();
        let err = h.server.invoke("ping", &[]).await.unwrap_err();
        assert!(matches!(err, InvokeError::NoClientConnected));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn invoke_while_unconfigured_fails_immediately() {
        let h = harness("secret", InvokeRetryConfig::default());
        h.server.start().await.unwrap();
        connect(&h).await;

        let err = h.server.invoke("ping", &[]).await.unwrap_err();
        assert!(matches!(err, InvokeError::NoClientConnected));
    }

    #[tokio::test]
    async fn invoke_times_out_after_the_configured_cadence() {
        let retry_config = InvokeRetryConfig {
            wake_interval: Duration::from_millis(25),
            max_wake_count: 4,
        };
        let mut h = harness("secret", retry_config);
        write_bundle(h.dir.path());
        h.server.start().await.unwrap();
        connect(&h).await;

        let started = Instant::now();
        let err = h.server.invoke("ping", &[]).await.unwrap_err();
        assert!(matches!(err, InvokeError::NoResponse));
        assert!(
            started.elapsed() >= Duration::from_millis(100),
            "gave up after {:?}, before the full cadence elapsed",
            started.elapsed(),
        );

        // The request itself did go out.
        let sent = recv_frame(&mut h.sent).await;
        let (method, params) = decode_request_frame(&sent.data);
        assert_eq!(method, "ping");
        assert!(params.is_empty());
    }

    #[tokio::test]
    async fn invoke_returns_the_client_response() {
        let mut h = harness("secret", InvokeRetryConfig::default());
        write_bundle(h.dir.path());
        h.server.start().await.unwrap();
        connect(&h).await;

        let server = Arc::clone(&h.server);
        let call = tokio::spawn(async move {
            server.invoke("status", &[RpcValue::Bool(true)]).await
        });

        let sent = recv_frame(&mut h.sent).await;
        let (method, params) = decode_request_frame(&sent.data);
        assert_eq!(method, "status");
        assert_eq!(params, vec![RpcValue::Bool(true)]);

        h.transport
            .push_event(TransportEvent::Packet {
                client: CLIENT,
                data: TestProtocol
                    .encode_response(&Ok(RpcValue::from("pong"))),
            })
            .await;

        let result = call.await.unwrap().unwrap();
        assert_eq!(result, RpcValue::from("pong"));
    }

    #[tokio::test]
    async fn invoke_surfaces_a_client_fault() {
        let mut h = harness("secret", InvokeRetryConfig::default());
        write_bundle(h.dir.path());
        h.server.start().await.unwrap();
        connect(&h).await;

        let server = Arc::clone(&h.server);
        let call =
            tokio::spawn(async move { server.invoke("status", &[]).await });

        let _ = recv_frame(&mut h.sent).await;
        h.transport
            .push_event(TransportEvent::Packet {
                client: CLIENT,
                data: TestProtocol.encode_response(&Err(RpcError::new(
                    -32601,
                    "Method not found.",
                ))),
            })
            .await;

        let err = call.await.unwrap().unwrap_err();
        match err {
            InvokeError::Fault(fault) => {
                assert_eq!(fault, RpcError::new(-32601, "Method not found."));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn concurrent_invokes_never_interleave() {
        let retry_config = InvokeRetryConfig {
            wake_interval: Duration::from_millis(25),
            max_wake_count: 40,
        };
        let mut h = harness("secret", retry_config);
        write_bundle(h.dir.path());
        h.server.start().await.unwrap();
        connect(&h).await;

        let server = Arc::clone(&h.server);
        let first =
            tokio::spawn(async move { server.invoke("first", &[]).await });
        let sent = recv_frame(&mut h.sent).await;
        assert_eq!(decode_request_frame(&sent.data).0, "first");

        let server = Arc::clone(&h.server);
        let second =
            tokio::spawn(async move { server.invoke("second", &[]).await });

        // The second call holds off until the first completes.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.sent.try_recv().is_err(), "second request sent early");

        h.transport
            .push_event(TransportEvent::Packet {
                client: CLIENT,
                data: TestProtocol.encode_response(&Ok(RpcValue::Void)),
            })
            .await;
        assert_eq!(first.await.unwrap().unwrap(), RpcValue::Void);

        let sent = recv_frame(&mut h.sent).await;
        assert_eq!(decode_request_frame(&sent.data).0, "second");
        h.transport
            .push_event(TransportEvent::Packet {
                client: CLIENT,
                data: TestProtocol
                    .encode_response(&Ok(RpcValue::from("done"))),
            })
            .await;
        assert_eq!(second.await.unwrap().unwrap(), RpcValue::from("done"));
    }

    #[tokio::test]
    async fn stop_unblocks_a_waiting_invoke() {
        let retry_config = InvokeRetryConfig {
            wake_interval: Duration::from_millis(50),
            max_wake_count: 100,
        };
        let mut h = harness("secret", retry_config);
        write_bundle(h.dir.path());
        h.server.start().await.unwrap();
        connect(&h).await;

        let server = Arc::clone(&h.server);
        let call =
            tokio::spawn(async move { server.invoke("slow", &[]).await });
        let _ = recv_frame(&mut h.sent).await;

        let started = Instant::now();
        h.server.stop().await;
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, InvokeError::NoResponse));
        // Well inside the five seconds the full cadence would take.
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn dispatcher_can_invoke_back_during_an_inbound_call() {
        let mut h = harness("secret", InvokeRetryConfig::default());
        write_bundle(h.dir.path());
        h.server.start().await.unwrap();
        connect(&h).await;

        {
            let created = h.factory.created.lock().unwrap();
            *created[0].invoke_during_call.lock().unwrap() =
                Some("readSensor".to_string());
        }

        h.transport
            .push_event(TransportEvent::Packet {
                client: CLIENT,
                data: TestProtocol.encode_request("poll", &[]),
            })
            .await;

        // The dispatcher turns the inbound call around into an outbound
        // invocation, which must flow while the inbound call is pending.
        let sent = recv_frame(&mut h.sent).await;
        assert_eq!(decode_request_frame(&sent.data).0, "readSensor");
        h.transport
            .push_event(TransportEvent::Packet {
                client: CLIENT,
                data: TestProtocol
                    .encode_response(&Ok(RpcValue::Integer(21))),
            })
            .await;

        let sent = recv_frame(&mut h.sent).await;
        assert_eq!(
            decode_response_frame(&sent.data),
            Ok(RpcValue::Integer(21))
        );
    }

    #[tokio::test]
    async fn dispatcher_invoker_reports_faults_not_internals() {
        let h = harness("secret", InvokeRetryConfig::default());
        write_bundle(h.dir.path());
        h.server.start().await.unwrap();
        // No client connected.

        let invoker =
            Arc::clone(&h.factory.created.lock().unwrap()[0].invoker);
        let fault = invoker.invoke("ping", Vec::new()).await.unwrap_err();
        assert_eq!(fault, RpcError::new(-1, "No client connected."));
    }
}
