// beacon: Telemetry generator client library.
//
// Services embed a `Generator` to frame diagnostic messages onto a
// resilient TCP session to a central Collector, cache and replay keyed UVE
// records under the sequence-number sync protocol, keep in-memory trace
// rings for post-hoc debugging, and expose an embedded HTTP introspect
// surface for operators.

pub mod client;
pub mod config;
pub mod connection_info;
pub mod generator;
pub mod introspect;
pub mod logging;
pub mod queue;
pub mod rate_limit;
pub mod session;
pub mod state_machine;
pub mod stats;
pub mod trace;
pub mod uve;

pub use config::GeneratorConfig;
pub use connection_info::{ConnStatus, ConnectionState, ProcessState};
pub use generator::Generator;
pub use state_machine::SmState;

// Re-export the wire types callers build submissions from.
pub use beacon_protocol::{
    DynamicUveData, Level, Message, MessageHeader, MessageKind, TxDropReason, UveData, UvePayload,
};
