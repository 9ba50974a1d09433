//! SSH plumbing: endpoint argument building, remote command execution,
//! `UI_HOME` management and local key bootstrapping.

pub mod endpoint;
pub mod keys;
pub mod remote;

pub use endpoint::SshEndpoint;
pub use remote::{RemoteOutput, RemoteShell, SshRemoteShell};
