//! JSON-RPC 2.0 message model
//!
//! Field-shape classification of inbound messages, the request id space,
//! and the error-object/response constructors.

pub mod message;

pub use message::{
    CANCEL_REQUEST_METHOD, ErrorObject, JSONRPC_VERSION, Message, ProtocolError, Request,
    RequestId, Response, cancel_notification, classify, id_key, notification,
};
