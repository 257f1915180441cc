// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the TCP/TLS listener collaborator.
//!
//! The transport owns sockets, TLS handshakes and read/write loops; the
//! server only sees typed events on a channel and a handful of control
//! operations. The protocol assumes a single management client, which the
//! transport enforces via `ServerParams::max_connections`.

use async_trait::async_trait;
use camino::Utf8PathBuf;
use std::io;
use thiserror::Error;
use tokio::sync::mpsc;

/// Opaque identifier the transport assigns to a client connection.
pub type ClientId = u64;

/// Events delivered by the transport while a listener is running.
///
/// The sender handed to [`Transport::start_server`] is dropped when the
/// listener stops, closing the channel.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected { client: ClientId, address: String, port: u16 },
    Packet { client: ClientId, data: Vec<u8> },
}

/// TLS posture for one listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsPolicy {
    pub enabled: bool,
    pub require_client_cert: bool,
    pub ca_file: Option<Utf8PathBuf>,
    pub cert_file: Option<Utf8PathBuf>,
    pub key_file: Option<Utf8PathBuf>,
    pub dh_param_file: Option<Utf8PathBuf>,
}

/// Listener configuration passed to [`Transport::start_server`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerParams {
    pub listen_address: String,
    pub port: u16,
    pub max_connections: usize,
    pub tls: TlsPolicy,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind listener on {address} port {port}")]
    Bind {
        address: String,
        port: u16,
        #[source]
        err: io::Error,
    },
    #[error("failed to send to client {client}")]
    Send {
        client: ClientId,
        #[source]
        err: io::Error,
    },
    #[error("client {0} is not connected")]
    NotConnected(ClientId),
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens the listening endpoint and begins delivering events on
    /// `events`. Returns the address the listener actually bound.
    async fn start_server(
        &self,
        params: ServerParams,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<String, TransportError>;

    /// Stops accepting connections and begins tearing down existing ones.
    async fn stop_server(&self);

    /// Resolves once every connection and the listener itself have
    /// quiesced. Sends fail fast once this has resolved.
    async fn wait_for_server_stopped(&self);

    /// Writes `data` to the given client, optionally closing the
    /// connection once the write completes.
    async fn send_to_client(
        &self,
        client: ClientId,
        data: Vec<u8>,
        close_after_send: bool,
    ) -> Result<(), TransportError>;

    /// Number of currently connected clients.
    fn client_count(&self) -> usize;
}
