// Library interface for the floodmesh overlay node
// This allows tests and the binary to drive the node engine directly

pub mod config;
pub mod wire;
pub mod peer_cache;
pub mod registry;
pub mod msg_store;
pub mod kv;
pub mod local_addr;
pub mod overlay;
pub mod dispatch;
pub mod maintain;
pub mod network;

pub use dispatch::DispatchError;
pub use kv::{KeyValueStore, MemoryStore};
pub use local_addr::{InterfaceAddrs, LocalAddrs};
pub use network::Node;
pub use overlay::{Action, Overlay, QueryHit, Settings};
pub use registry::{ConnId, PeerId};
pub use wire::{Body, Frame, MsgType};
