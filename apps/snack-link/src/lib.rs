pub mod capability;
pub mod channel;
pub mod collaborators;
pub mod config;
pub mod dispatch;
pub mod registry;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use capability::CapabilityTable;
pub use channel::{ChannelDescriptor, ChannelError, resolve_channel};
pub use config::Config;
pub use session::{Collaborators, Session, SessionConfig, SessionEvent};
pub use transport::{
    BackendKind, Transport, TransportConfig, TransportError, TransportEvent, TransportResources,
    create_transport, create_transport_with,
};
