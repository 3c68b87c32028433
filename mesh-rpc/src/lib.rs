//! The RPC Surface (§4.8) and Outbound RPC Dispatch (§4.9).

pub mod dispatch;
pub mod server;

pub mod proto {
    tonic::include_proto!("mesh.rpc");

    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("mesh_rpc");
}

pub use dispatch::{CallOptions, OutboundDispatcher};
pub use server::{DebugHandler, MeshRpcServer};
