//! ingressd - a Kubernetes ingress controller that keeps a supervised nginx
//! child in continuous agreement with cluster state.
//!
//! The controller watches Ingress and Secret resources over the streaming
//! control-plane API, translates them into an in-memory host/location table,
//! renders that table to nginx configuration files and signals the child to
//! reload on every change.

pub mod config;
pub mod controller;
pub mod error;
pub mod kube;
pub mod metrics;
pub mod nginx;

pub use error::Error;
