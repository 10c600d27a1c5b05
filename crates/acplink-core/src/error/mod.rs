//! Error handling for acplink
//!
//! Two layers of error live here:
//!
//! - [`RpcError`]: everything a local caller can observe (transport failures,
//!   cancellation, backpressure, invalid state changes, pool conditions).
//! - [`ProtocolError`]: the JSON-RPC error object exchanged on the wire. A
//!   remote error response reaches callers as [`RpcError::Protocol`] so they
//!   can branch on the numeric code.

mod protocol_error;
mod types;

pub use protocol_error::{ProtocolError, codes};
pub use types::{ErrorKind, RpcError, RpcResult};
