//! helmsman-remote — client for the remote ASG management service.
//!
//! The remote service manages auto-scaling groups per region. Mutating
//! operations are form POSTs that answer `302 Found` with a `Location`
//! header; long-running operations redirect to a task resource whose
//! `.json` representation the tracker polls. Listings are `.json` show
//! endpoints.
//!
//! The client is deliberately non-throwing for non-2xx responses below
//! the operation helpers: callers inspect status and body. Redirects are
//! disabled so the 302s stay observable.

pub mod client;
pub mod error;
pub mod time;
pub mod transform;

pub use client::{
    created_group_name, AsgClient, ClusterAction, ClusterGroup, GroupDetails, GroupInstance,
    LoadBalancerDetails, LoadBalancerInstanceState, PostResponse, RemoteConfig, RemoteTask,
    SecurityGroup,
};
pub use error::{RemoteError, RemoteResult};
pub use transform::{form_fields, TransformContext};
