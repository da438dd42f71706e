//! Operator core for stoppable containers.
//!
//! A `Workload` declares a desired image, command, and a `running` flag; the
//! workload controller projects it onto exactly one `Instance`, and the
//! instance controller realizes that instance as a provider pod (keeps the
//! rootfs alive and drives the mount rendezvous) plus a consumer pod (chroots
//! into the preserved rootfs and runs the user's command). Toggling `running`
//! tears the consumer down and brings it back while the provider keeps the
//! overlay mounted in place.

pub mod capabilities;
pub mod common;
pub mod conditions;
pub mod config;
pub mod context;
pub mod instance_controller;
pub mod instance_types;
pub mod pod_builder;
pub mod pod_status;
pub mod store;
pub mod workload_controller;
pub mod workload_types;
