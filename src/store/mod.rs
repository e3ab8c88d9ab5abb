//! Store client layer: the typed surface over the external issue store.

pub mod bd;
pub mod client;
pub mod routing;

pub use bd::BdClient;
pub use client::{BeadPatch, ListFilter, StoreClient, StoreError};
pub use routing::{RouteEntry, RoutingError, RoutingTable};
