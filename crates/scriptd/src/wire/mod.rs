//! Framed pipe protocol between the control daemon and the script worker.
//!
//! One pipe per direction, one framed channel per pipe:
//! - **Control→Worker**: RunScript, Flush, FlushJob, UpdateDebugFlags,
//!   UpdateLog, Shutdown
//! - **Worker→Control**: ScriptComplete
//!
//! # Architecture
//!
//! - **protocol**: Message types and payload bodies
//! - **codec**: `TYPE | LEN | PAYLOAD` framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
