pub mod connection;
pub mod registry;
pub mod router;
pub mod websocket;

pub use connection::{Connection, ConnectionState, OutboundFrame};
pub use registry::ConnectionRegistry;
pub use router::MessageRouter;
