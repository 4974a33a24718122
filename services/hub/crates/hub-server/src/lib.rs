//! Fleet hub: holds one long-lived connection per router agent and relays
//! commands to it from the device API.
//!
//! Each device is served by a single actor task ([`Hub`] routes to it) that
//! owns the socket, the command queue and the cached telemetry, and writes a
//! snapshot to the [`SnapshotStore`] so it can hibernate and resume.

mod actor;
pub mod config;
pub mod error;
pub mod events;
pub mod hub;
pub mod registry;
pub mod router;
pub mod snapshot;
pub mod store;
pub mod valkey;
pub mod ws;

pub use config::HubConfig;
pub use error::{DispatchError, HubError, StoreError};
pub use events::{DeviceEvent, EventSink, MemoryEvents};
pub use hub::{ActorView, AgentConnection, ConnId, Hub, HubSettings, Outbound, close_codes};
pub use registry::{DeviceRecord, DeviceRegistry, StaticRegistry};
pub use router::{AppState, build_router};
pub use snapshot::{ConnectionState, Snapshot};
pub use store::{MemoryStore, SnapshotStore};
pub use valkey::{ValkeyOptions, ValkeyStore};
