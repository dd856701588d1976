//! Mesh control-plane state.
//!
//! Fuses two views of the mesh into one answer: which revision is each
//! proxied pod running, and which revision should it be running. Revision
//! tags come from the injector's admission webhooks plus namespace labels;
//! actual proxy revisions come from an xDS debug-synchronization query
//! against the control plane.

pub mod proxy_status;
pub mod state;
pub mod tags;
pub mod xds;

pub use proxy_status::{ProxyStatusRecord, ProxyStatusSource};
pub use state::MeshState;
pub use tags::{KubeMeshApi, MeshApi, RevisionTag};
