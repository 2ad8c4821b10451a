//! Live session delivery: admission control, the outbound connection, and
//! the per-session actor with its registry.

pub mod admission;
pub mod connection;
pub mod session;

pub use admission::{Admission, AdmissionConfig, AdmissionError, AdmissionPermit};
pub use connection::{LiveConnection, TransportClosed};
pub use session::{ConnectionManager, OpenedSession, SessionConfig, SessionInfo, SessionState};
