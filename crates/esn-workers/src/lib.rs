//! esn-workers
//!
//! Consumers of the five job queues: check-in notification fan-out,
//! escalation transitions, the release procedure, and the two outbound
//! transport queues. See `handlers` for per-queue semantics and `pool` for
//! the concurrency model (release is globally serialized).

mod handlers;
mod pool;
pub mod transports;

pub use handlers::{execute, job_user_id, WorkerContext, WorkerError};
pub use pool::{process_one, PoolConfig, WorkerPool};
pub use transports::{
    EmailMessage, EmailTransport, HttpEmailTransport, HttpSmsTransport, SmsMessage, SmsTransport,
    TransportError,
};
