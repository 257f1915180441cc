// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Gateway configuration, read once per `start()`.

use camino::Utf8PathBuf;
use serde::Deserialize;

/// Configuration for one gateway process.
///
/// Field names follow the gateway config-file dialect (camelCase keys), so
/// this deserializes directly from a parsed config document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySettings {
    /// Device-family name served by this gateway (e.g. `enocean`).
    pub family: String,

    /// Address the listener binds to.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Service port used once the gateway is configured.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bootstrap port used while the gateway is unconfigured.
    #[serde(default = "default_port_unconfigured")]
    pub port_unconfigured: u16,

    /// Directory holding the gateway's TLS material.
    pub data_path: Utf8PathBuf,

    /// Overrides for the TLS artifact paths; when unset, the artifacts are
    /// expected under `data_path`.
    #[serde(default)]
    pub ca_file: Option<Utf8PathBuf>,
    #[serde(default)]
    pub cert_path: Option<Utf8PathBuf>,
    #[serde(default)]
    pub key_path: Option<Utf8PathBuf>,
    #[serde(default)]
    pub dh_path: Option<Utf8PathBuf>,

    /// Password the bootstrap provisioning payload is encrypted with. An
    /// unconfigured gateway refuses to start without one.
    #[serde(default)]
    pub configuration_password: String,

    /// User and group that should own materialized TLS keys.
    #[serde(default)]
    pub run_as_user: Option<String>,
    #[serde(default)]
    pub run_as_group: Option<String>,
}

fn default_listen_address() -> String {
    "::".to_string()
}

fn default_port() -> u16 {
    2017
}

fn default_port_unconfigured() -> u16 {
    2018
}
