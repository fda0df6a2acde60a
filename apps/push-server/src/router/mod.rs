//! Routing table of locally connected users and the cursor broadcasts walk.

pub mod cursor;
pub mod table;

pub use cursor::{RouteCursor, RouteEntry};
pub use table::{LocalRouter, RoutingTable};
