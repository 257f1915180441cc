// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Behavior implemented by device-family method dispatchers.

use crate::RpcResult;
use crate::RpcValue;
use async_trait::async_trait;
use std::sync::Arc;

/// Device-family RPC method surface, reachable once the gateway is
/// configured.
#[async_trait]
pub trait MethodDispatcher: Send + Sync {
    /// Numeric identifier of the device family this dispatcher serves.
    fn family_id(&self) -> i32;

    /// Handles one inbound method call from the management client.
    async fn call_method(
        &self,
        method: &str,
        params: Vec<RpcValue>,
    ) -> RpcResult;
}

/// Outbound-invoke function injected into a dispatcher so family logic can
/// call methods on the connected management client.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, method: &str, params: Vec<RpcValue>) -> RpcResult;
}

/// Constructs the dispatcher for a named device family.
pub trait DispatcherFactory: Send + Sync + 'static {
    /// Returns `None` for unrecognized family names.
    fn create(
        &self,
        family: &str,
        invoker: Arc<dyn Invoker>,
    ) -> Option<Arc<dyn MethodDispatcher>>;
}
