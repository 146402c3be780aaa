//! Typed channel used to hand decoded RPC events up from the Link RPC
//! to whoever installed the stream (spec.md §4.C: "install handlers
//! for `on_message`, `on_close`, `on_error`").
//!
//! Mirrors the teacher's `MessageChannelTx`/`MessageChannelRx` pattern
//! (`communication::channel`, referenced throughout
//! `communication::mod.rs` but not itself present in the retrieval
//! pack) on top of `tokio::sync::mpsc` rather than `futures::channel`,
//! since the rest of this crate already runs on `tokio`.

use tokio::sync::mpsc;

use crate::core::identity::NodeId;
use crate::core::rpc::message::RpcMessage;

/// Events the Link RPC emits upward as it processes inbound frames.
#[derive(Debug, Clone)]
pub enum RpcEvent {
    /// A stream was attached and is ready to use.
    Listening(NodeId),
    /// A decoded RPC message arrived from `NodeId`.
    Message(RpcMessage, NodeId),
    /// An inbound `ping` arrived from `NodeId` (emitted in addition to
    /// the synthesized `pong` reply, per spec.md §4.C).
    Ping(NodeId),
}

pub type RpcEventTx = mpsc::UnboundedSender<RpcEvent>;
pub type RpcEventRx = mpsc::UnboundedReceiver<RpcEvent>;

pub fn new_event_channel() -> (RpcEventTx, RpcEventRx) {
    mpsc::unbounded_channel()
}
