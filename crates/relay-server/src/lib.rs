//! Relay Server - channel hubs, connection pumps and the HTTP/WebSocket API
//!
//! Data flow: a peer opens a WebSocket, the [`ChannelRegistry`] resolves
//! the hub for its channel, a [`Connection`] joins that hub and runs its
//! pumps, and the coordinators publish events back through the registry.

pub mod connection;
pub mod http;
pub mod hub;
pub mod push;
pub mod registry;
pub mod requests;
pub mod state;
pub mod tls;
pub mod transport;
pub mod websocket;

pub use connection::{Connection, InboundHandler};
pub use http::{create_router, ApiError};
pub use hub::{Hub, MemberId, Peer, Subscription};
pub use push::{LogNotifier, PushNotifier};
pub use registry::ChannelRegistry;
pub use requests::{SweepReport, TokenRequestCoordinator};
pub use state::AppState;
pub use tls::{calculate_cert_fingerprint, create_rustls_config, load_tls_config, TlsError};
pub use transport::{split_websocket, FrameReader, FrameWriter};
pub use websocket::{device_ws_handler, extension_ws_handler, handle_socket};
