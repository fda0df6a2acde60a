//! WebSocket gateway: handshakes clients, registers their routes and
//! carries pushes to them.

pub mod events;
pub mod server;
pub mod session;

pub use session::GatewaySession;
