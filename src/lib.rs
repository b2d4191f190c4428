//! Real-time status board for fire-service dispatch rooms.
//!
//! A session ("Leitstelle") is created over HTTP and issues three access
//! codes: one for the dispatch room, one shared by vehicles, one for the
//! unit leader. Participants attach over WebSocket, report status changes
//! in the FMS scheme, and receive a full session snapshot after every
//! mutation. A background reaper removes connections that went quiet.

pub mod api;
pub mod config;
pub mod connection;
pub mod manager;
pub mod protocol;
pub mod reaper;
pub mod session;
pub mod status;
