// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resolution of the gateway's TLS artifact paths.

use crate::settings::GatewaySettings;
use camino::Utf8Path;
use camino::Utf8PathBuf;

pub const CA_FILE_NAME: &str = "ca.crt";
pub const CERT_FILE_NAME: &str = "gateway.crt";
pub const KEY_FILE_NAME: &str = "gateway.key";
pub const DH_FILE_NAME: &str = "dh.pem";

/// The gateway's TLS material, resolved fresh on every `start()`.
///
/// CA, certificate and key paths are only present when the file exists on
/// disk; a bundle missing any of the three leaves the gateway unconfigured.
/// The DH parameter path is resolved unconditionally and handed to the
/// transport as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    ca: Option<Utf8PathBuf>,
    cert: Option<Utf8PathBuf>,
    key: Option<Utf8PathBuf>,
    dh: Utf8PathBuf,
}

impl CertificateBundle {
    pub fn resolve(settings: &GatewaySettings) -> Self {
        Self {
            ca: resolve_existing(
                settings.ca_file.as_deref(),
                &settings.data_path,
                CA_FILE_NAME,
            ),
            cert: resolve_existing(
                settings.cert_path.as_deref(),
                &settings.data_path,
                CERT_FILE_NAME,
            ),
            key: resolve_existing(
                settings.key_path.as_deref(),
                &settings.data_path,
                KEY_FILE_NAME,
            ),
            dh: settings
                .dh_path
                .clone()
                .unwrap_or_else(|| settings.data_path.join(DH_FILE_NAME)),
        }
    }

    /// True when CA, certificate and key are all present on disk.
    pub fn is_complete(&self) -> bool {
        self.ca.is_some() && self.cert.is_some() && self.key.is_some()
    }

    pub fn ca(&self) -> Option<&Utf8Path> {
        self.ca.as_deref()
    }

    pub fn cert(&self) -> Option<&Utf8Path> {
        self.cert.as_deref()
    }

    pub fn key(&self) -> Option<&Utf8Path> {
        self.key.as_deref()
    }

    pub fn dh_params(&self) -> &Utf8Path {
        &self.dh
    }
}

fn resolve_existing(
    override_path: Option<&Utf8Path>,
    data_path: &Utf8Path,
    default_name: &str,
) -> Option<Utf8PathBuf> {
    let path = match override_path {
        Some(path) => path.to_owned(),
        None => data_path.join(default_name),
    };
    path.is_file().then_some(path)
}
