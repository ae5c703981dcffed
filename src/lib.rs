//! The LizardFS metadata master and the pieces the admin tool shares with
//! it.
//!
//! The client data plane lives in the `lfs-client` crate, shared entity
//! types in `lfs-api-types`, and the wire protocol in `lfs-protocol`.

pub mod master;

pub mod server_connection;
pub use server_connection::ServerConnection;
