//! etcd restore operator
//!
//! Every replica registers a Service for itself and competes for a Lease.
//! Only the replica holding the Lease runs the EtcdRestore controller; losing
//! the Lease ends the process so a fresh replica can take over.

#![deny(missing_docs)]

pub mod bootstrap;
pub mod config;
pub mod controller;
pub mod crd;
pub mod lifecycle;
pub mod probe;
