// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Incremental frame assembly and wire-codec traits.

use crate::RpcResult;
use crate::RpcValue;
use thiserror::Error;

/// Direction discriminator of a completed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
}

/// Errors surfaced by wire-protocol implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("frame length {length} exceeds the {limit}-byte limit")]
    FrameTooLarge { length: usize, limit: usize },
    #[error("malformed value encoding: {0}")]
    MalformedValue(String),
}

/// Incremental re-assembly of one frame from a byte stream.
///
/// A packet delivered by the transport may contain several frames, or only
/// part of one, so the caller feeds the same buffer repeatedly until every
/// byte is consumed. Implementations must consume at least one byte per
/// `feed()` unless a completed frame is pending; the caller resets the
/// assembler after taking every completed frame, including on error paths.
pub trait FrameAssembler: Send {
    /// Consumes a prefix of `data`, returning how many bytes were used.
    fn feed(&mut self, data: &[u8]) -> Result<usize, WireError>;

    /// True once a full frame has been accumulated.
    fn is_complete(&self) -> bool;

    /// The frame's direction, or `None` until enough of the header has been
    /// consumed to classify it.
    fn kind(&self) -> Option<FrameKind>;

    /// Returns the completed frame's payload bytes.
    fn take_frame(&mut self) -> Vec<u8>;

    /// Discards all accumulated state.
    fn reset(&mut self);
}

/// Encode/decode half of the binary RPC collaborator.
pub trait WireProtocol: Send + Sync + 'static {
    type Assembler: FrameAssembler + Send + 'static;

    /// Creates a fresh assembler for one connection's byte stream.
    fn assembler(&self) -> Self::Assembler;

    /// Decodes a request frame into its method name and arguments.
    fn decode_request(
        &self,
        frame: &[u8],
    ) -> Result<(String, Vec<RpcValue>), WireError>;

    /// Decodes a response frame into a value or a structured fault.
    fn decode_response(&self, frame: &[u8]) -> Result<RpcResult, WireError>;

    fn encode_request(&self, method: &str, params: &[RpcValue]) -> Vec<u8>;

    fn encode_response(&self, response: &RpcResult) -> Vec<u8>;
}
