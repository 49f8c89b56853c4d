//! Browser-facing side of the gateway: WebSocket fan-out of live device
//! updates and the full-state snapshot API.

mod broadcaster;
mod server;

pub use broadcaster::{DeviceReadings, DeviceUiState, UiBroadcaster};
pub use server::{serve, SnapshotEntry};
