//! Shared types for the Gondolin network interception plane: the error
//! taxonomy, flow identity and TCP state, and the lock-free counters used
//! for per-session observability.

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod error;
pub mod flow;
pub mod metrics;

pub use error::{GondolinError, GondolinResult};
pub use flow::{FlowFlags, FlowKey, TcpState};
pub use metrics::{SessionMetrics, SessionMetricsSnapshot};
