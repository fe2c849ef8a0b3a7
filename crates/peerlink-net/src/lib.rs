// WebSocket mesh networking for Peerlink nodes.

pub mod client;
pub mod config;
pub mod connection;
pub mod context;
pub mod delivery;
pub mod directory;
pub mod error;
pub mod events;
pub mod handler;
pub mod listener;
pub mod node;
pub mod presence;
pub mod session;

pub use config::NodeConfig;
pub use delivery::GroupProgress;
pub use error::NetError;
pub use events::{DeliveryStatus, DeliveryUpdate, EventSink, NodeEvent, ReceivedMessage};
pub use node::Node;
