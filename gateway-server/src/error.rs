// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::transport::TransportError;
use camino::Utf8PathBuf;
use gateway_rpc::frame::WireError;
use gateway_rpc::RpcError;
use std::io;
use thiserror::Error;

/// Fatal `start()` failures. None of these leave a listener open.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("setting `family` is empty")]
    EmptyFamily,
    #[error("unknown family: {0}")]
    UnknownFamily(String),
    #[error("gateway is unconfigured but no configuration password is set")]
    MissingConfigurationPassword,
    #[error("server is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures of an outbound invocation toward the management client.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("no client connected")]
    NoClientConnected,
    #[error("no RPC response received")]
    NoResponse,
    #[error("client returned a fault")]
    Fault(#[source] RpcError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl InvokeError {
    /// Collapses the error into the fault value a dispatcher sees, keeping
    /// transport internals out of the wire dialect.
    pub fn into_fault(self) -> RpcError {
        match self {
            InvokeError::NoClientConnected => {
                RpcError::new(-1, "No client connected.")
            }
            InvokeError::NoResponse => {
                RpcError::new(-32500, "No RPC response received.")
            }
            InvokeError::Fault(fault) => fault,
            InvokeError::Transport(_) => RpcError::new(
                -32500,
                "Unknown application error. See log for more details.",
            ),
        }
    }
}

/// Failures of the bootstrap `configure` operation.
///
/// Hex, authentication and padding failures all collapse into `DataInvalid`
/// so the wire never distinguishes them.
#[derive(Debug, Error)]
pub enum ConfigureError {
    #[error("wrong parameter count")]
    WrongParameterCount,
    #[error("parameter is not of type String")]
    WrongParameterType,
    #[error("data is invalid")]
    DataInvalid,
    #[error("could not derive AES key from the configuration password")]
    KeyDerivation,
    #[error("failed to decode decrypted provisioning data")]
    Decode(#[source] WireError),
    #[error("data is not of type Struct")]
    NotAStruct,
    #[error("data does not contain element {0:?}")]
    MissingField(&'static str),
    #[error("failed to write {path}")]
    WriteCertificate {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
}

impl ConfigureError {
    /// The fault value reported to the provisioning client.
    pub fn fault(&self) -> RpcError {
        match self {
            ConfigureError::WrongParameterCount => {
                RpcError::new(-1, "Wrong parameter count.")
            }
            ConfigureError::WrongParameterType => {
                RpcError::new(-1, "Parameter is not of type String.")
            }
            ConfigureError::DataInvalid => {
                RpcError::new(-2, "Data is invalid.")
            }
            ConfigureError::NotAStruct => {
                RpcError::new(-1, "Data is not of type Struct.")
            }
            ConfigureError::MissingField(field) => RpcError::new(
                -1,
                format!("Data does not contain element \"{field}\"."),
            ),
            ConfigureError::KeyDerivation
            | ConfigureError::Decode(_)
            | ConfigureError::WriteCertificate { .. } => RpcError::new(
                -32500,
                "Unknown application error. See log for more details.",
            ),
        }
    }
}
