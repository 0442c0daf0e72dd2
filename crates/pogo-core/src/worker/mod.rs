//! Worker pool and RPC
//!
//! Persistent mutually-authenticated TLS sessions to the worker fleet, a
//! length-prefixed JSON protocol with request/response multiplexing, fair
//! dispatch selection, reconnect grace, and one-shot secret delivery.

pub mod connection;
pub mod pool;
pub mod protocol;
pub mod secrets;

pub use connection::{build_tls_config, connect, fingerprint, WorkerFramed, WorkerStream};
pub use pool::{DispatchTask, PoolStats, TaskEvent, TaskSink, WorkerPool, WorkerStats};
pub use protocol::{Codec, Message, ReqId, MAX_FRAME_BYTES, PROTOCOL_VERSION};
pub use secrets::{Secret, SecretVault};
