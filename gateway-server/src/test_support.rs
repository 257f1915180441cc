// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fake collaborators for exercising the server without sockets or a real
//! wire codec.

use crate::transport::ClientId;
use crate::transport::ServerParams;
use crate::transport::Transport;
use crate::transport::TransportError;
use crate::transport::TransportEvent;
use aes_gcm::aead::Aead;
use aes_gcm::aead::KeyInit;
use aes_gcm::Aes256Gcm;
use aes_gcm::Nonce;
use async_trait::async_trait;
use gateway_rpc::dispatch::DispatcherFactory;
use gateway_rpc::dispatch::Invoker;
use gateway_rpc::dispatch::MethodDispatcher;
use gateway_rpc::frame::FrameAssembler;
use gateway_rpc::frame::FrameKind;
use gateway_rpc::frame::WireError;
use gateway_rpc::frame::WireProtocol;
use gateway_rpc::RpcResult;
use gateway_rpc::RpcValue;
use sha2::Digest;
use sha2::Sha256;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc;

pub(crate) fn discard_logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

/// Builds an encrypted provisioning payload the way a management client
/// would: SHA-256 of the password as the key, a fixed IV and hex encoding.
pub(crate) fn encrypt_provisioning_payload(
    password: &str,
    plaintext: &[u8],
) -> String {
    let key = Sha256::digest(password.as_bytes());
    let cipher = Aes256Gcm::new_from_slice(&key).unwrap();
    let iv = [0x42u8; 12];
    let ciphertext =
        cipher.encrypt(Nonce::from_slice(&iv), plaintext).unwrap();
    format!("{}{}", hex::encode(iv), hex::encode(ciphertext))
}

/// RPC-encodes a provisioning struct the way `TestProtocol` decodes it.
pub(crate) fn provisioning_plaintext(fields: &[(&str, &str)]) -> Vec<u8> {
    let mut map = BTreeMap::new();
    for (field, pem) in fields {
        map.insert(field.to_string(), RpcValue::from(*pem));
    }
    let value: RpcResult = Ok(RpcValue::Struct(map));
    serde_json::to_vec(&value).unwrap()
}

/// Wire protocol used in tests: a one-byte direction tag (0 = request,
/// 1 = response) and a four-byte little-endian payload length, followed by
/// a JSON payload.
pub(crate) struct TestProtocol;

const MAX_TEST_FRAME: usize = 1 << 20;

const FRAME_HEADER_LEN: usize = 5;

pub(crate) fn frame_bytes(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![tag];
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[derive(Default)]
pub(crate) struct TestAssembler {
    header: Vec<u8>,
    payload: Vec<u8>,
    need: Option<(FrameKind, usize)>,
}

impl FrameAssembler for TestAssembler {
    fn feed(&mut self, data: &[u8]) -> Result<usize, WireError> {
        let mut used = 0;
        if self.need.is_none() {
            while self.header.len() < FRAME_HEADER_LEN && used < data.len() {
                self.header.push(data[used]);
                used += 1;
            }
            if self.header.len() < FRAME_HEADER_LEN {
                return Ok(used);
            }
            let kind = match self.header[0] {
                0 => FrameKind::Request,
                1 => FrameKind::Response,
                _ => return Err(WireError::MalformedFrame("unknown frame tag")),
            };
            let length =
                u32::from_le_bytes(self.header[1..5].try_into().unwrap())
                    as usize;
            if length > MAX_TEST_FRAME {
                return Err(WireError::FrameTooLarge {
                    length,
                    limit: MAX_TEST_FRAME,
                });
            }
            self.need = Some((kind, length));
        }
        if let Some((_, length)) = self.need {
            let take =
                usize::min(length - self.payload.len(), data.len() - used);
            self.payload.extend_from_slice(&data[used..used + take]);
            used += take;
        }
        Ok(used)
    }

    fn is_complete(&self) -> bool {
        matches!(self.need, Some((_, length)) if self.payload.len() == length)
    }

    fn kind(&self) -> Option<FrameKind> {
        self.need.map(|(kind, _)| kind)
    }

    fn take_frame(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.payload)
    }

    fn reset(&mut self) {
        self.header.clear();
        self.payload.clear();
        self.need = None;
    }
}

impl WireProtocol for TestProtocol {
    type Assembler = TestAssembler;

    fn assembler(&self) -> TestAssembler {
        TestAssembler::default()
    }

    fn decode_request(
        &self,
        frame: &[u8],
    ) -> Result<(String, Vec<RpcValue>), WireError> {
        serde_json::from_slice(frame)
            .map_err(|err| WireError::MalformedValue(err.to_string()))
    }

    fn decode_response(&self, frame: &[u8]) -> Result<RpcResult, WireError> {
        serde_json::from_slice(frame)
            .map_err(|err| WireError::MalformedValue(err.to_string()))
    }

    fn encode_request(&self, method: &str, params: &[RpcValue]) -> Vec<u8> {
        frame_bytes(0, &serde_json::to_vec(&(method, params)).unwrap())
    }

    fn encode_response(&self, response: &RpcResult) -> Vec<u8> {
        frame_bytes(1, &serde_json::to_vec(response).unwrap())
    }
}

/// Strips the test-frame header off an encoded response and decodes it.
pub(crate) fn decode_response_frame(frame: &[u8]) -> RpcResult {
    assert_eq!(frame[0], 1, "not a response frame");
    serde_json::from_slice(&frame[FRAME_HEADER_LEN..]).unwrap()
}

/// Strips the test-frame header off an encoded request and decodes it.
pub(crate) fn decode_request_frame(frame: &[u8]) -> (String, Vec<RpcValue>) {
    assert_eq!(frame[0], 0, "not a request frame");
    serde_json::from_slice(&frame[FRAME_HEADER_LEN..]).unwrap()
}

/// One write captured by [`FakeTransport`].
#[derive(Debug)]
pub(crate) struct SentFrame {
    pub client: ClientId,
    pub data: Vec<u8>,
    pub close_after_send: bool,
}

#[derive(Default)]
struct FakeTransportState {
    running: bool,
    starts: Vec<ServerParams>,
    events_tx: Option<mpsc::Sender<TransportEvent>>,
    clients: usize,
}

/// A transport whose listener is a channel: tests inject events and read
/// sent frames back out.
pub(crate) struct FakeTransport {
    state: Mutex<FakeTransportState>,
    sent_tx: mpsc::UnboundedSender<SentFrame>,
}

impl FakeTransport {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SentFrame>) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            state: Mutex::new(FakeTransportState::default()),
            sent_tx,
        });
        (transport, sent_rx)
    }

    pub(crate) fn starts(&self) -> Vec<ServerParams> {
        self.state.lock().unwrap().starts.clone()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    pub(crate) fn set_client_count(&self, clients: usize) {
        self.state.lock().unwrap().clients = clients;
    }

    pub(crate) async fn push_event(&self, event: TransportEvent) {
        let events_tx = self
            .state
            .lock()
            .unwrap()
            .events_tx
            .clone()
            .expect("transport not started");
        events_tx.send(event).await.unwrap();
    }

    /// Connects the single fake client and announces it.
    pub(crate) async fn connect_client(&self, client: ClientId) {
        self.set_client_count(1);
        self.push_event(TransportEvent::Connected {
            client,
            address: "192.0.2.10".to_string(),
            port: 45921,
        })
        .await;
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn start_server(
        &self,
        params: ServerParams,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<String, TransportError> {
        let mut state = self.state.lock().unwrap();
        let bound = format!("{}:{}", params.listen_address, params.port);
        state.starts.push(params);
        state.events_tx = Some(events);
        state.running = true;
        Ok(bound)
    }

    async fn stop_server(&self) {
        let mut state = self.state.lock().unwrap();
        state.running = false;
        state.clients = 0;
        // Dropping the sender closes the event channel, which is how the
        // dispatch task learns the listener is gone.
        state.events_tx = None;
    }

    async fn wait_for_server_stopped(&self) {}

    async fn send_to_client(
        &self,
        client: ClientId,
        data: Vec<u8>,
        close_after_send: bool,
    ) -> Result<(), TransportError> {
        if !self.state.lock().unwrap().running {
            return Err(TransportError::NotConnected(client));
        }
        let _ = self.sent_tx.send(SentFrame { client, data, close_after_send });
        Ok(())
    }

    fn client_count(&self) -> usize {
        self.state.lock().unwrap().clients
    }
}

/// Family dispatcher that records calls and answers with a fixed value.
/// When `invoke_during_call` is set, it first calls that method back on the
/// connected client and answers with whatever the client returned.
pub(crate) struct FakeFamily {
    pub calls: Mutex<Vec<(String, Vec<RpcValue>)>>,
    pub invoke_during_call: Mutex<Option<String>>,
    pub invoker: Arc<dyn Invoker>,
}

#[async_trait]
impl MethodDispatcher for FakeFamily {
    fn family_id(&self) -> i32 {
        42
    }

    async fn call_method(
        &self,
        method: &str,
        params: Vec<RpcValue>,
    ) -> RpcResult {
        self.calls.lock().unwrap().push((method.to_string(), params));
        let callback = self.invoke_during_call.lock().unwrap().clone();
        if let Some(callback) = callback {
            return self.invoker.invoke(&callback, Vec::new()).await;
        }
        Ok(RpcValue::from("dispatched"))
    }
}

/// Factory recognizing only the `enocean` family, keeping every dispatcher
/// it creates so tests can inspect recorded calls.
#[derive(Default)]
pub(crate) struct FakeFamilyFactory {
    pub created: Mutex<Vec<Arc<FakeFamily>>>,
}

impl DispatcherFactory for FakeFamilyFactory {
    fn create(
        &self,
        family: &str,
        invoker: Arc<dyn Invoker>,
    ) -> Option<Arc<dyn MethodDispatcher>> {
        if family != "enocean" {
            return None;
        }
        let dispatcher = Arc::new(FakeFamily {
            calls: Mutex::new(Vec::new()),
            invoke_during_call: Mutex::new(None),
            invoker,
        });
        self.created.lock().unwrap().push(Arc::clone(&dispatcher));
        Some(dispatcher)
    }
}
