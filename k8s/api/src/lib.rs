#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod policy;
pub mod virtual_server;

pub use self::{
    policy::{Policy, PolicySpec, PolicyStatus, RateLimit},
    virtual_server::{PolicyReference, VirtualServer, VirtualServerSpec, VirtualServerStatus},
};

/// The API group shared by every NGINX Ingress Controller custom resource.
pub const GROUP: &str = "k8s.nginx.org";

/// The served version of [`Policy`] and [`VirtualServer`].
pub const VERSION: &str = "v1";
