//! WebSocket front end for the query gateway.

pub mod connection;
pub mod gateway;
pub mod registry;
pub mod server;
pub mod settings;
pub mod shutdown;
pub mod socket;

pub use gateway::{NoProfiles, ProfileSource, QueryGateway, StaticProfiles};
pub use registry::{ConnectionHandle, ConnectionRegistry, TransportError};
pub use server::{start, ServerConfig, ServerHandle};
pub use settings::GatewaySettings;
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
