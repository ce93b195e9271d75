//! Install accelerator: watches the cluster lifecycle, applies the
//! user-supplied manifest bundle in parallel, approves pending install
//! plans, and exits once the cluster has finished installing.

#![forbid(unsafe_code)]

pub mod approver;
pub mod controller;
pub mod manifests;
