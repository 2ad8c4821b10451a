//! # duet-server
//!
//! Delivery side of the duet core.
//!
//! - Room event fan-out to live sessions ([`Broadcaster`])
//! - Live sessions: admission control, per-session delivery actor, registry
//! - [`ChatService`]: send, poll, typing, read receipts and presence
//! - Axum HTTP routes with an SSE stream per session
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod app;
pub mod broadcast;
pub mod errors;
pub mod health;
pub mod identity;
pub mod live;
pub mod server;
pub mod service;
pub mod shutdown;

pub use app::{Backend, DuetApp};
pub use broadcast::{Broadcaster, RoomEvent};
pub use errors::ApiError;
pub use live::{ConnectionManager, OpenedSession, SessionConfig, SessionInfo, SessionState};
pub use server::{build_router, start, AppState, ServerHandle};
pub use service::{ChatService, ReadState, RoomDirectory, SendMessage};
pub use shutdown::ShutdownCoordinator;
