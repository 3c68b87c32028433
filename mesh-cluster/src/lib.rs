//! Service Registry, Node Directory, and gossip integration (§4.6, §4.7).

pub mod directory;
pub mod gossip;
pub mod registry;
pub mod select;
pub mod transport;

pub use directory::NodeDirectory;
pub use gossip::GossipIntegration;
pub use registry::{RegistryBroadcast, ServiceEntry, ServiceRegistry};
pub use select::weighted_random_pick;
pub use transport::GossipTransport;
