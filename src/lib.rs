//! Control-plane supervisor around a client-certificate VPN daemon.
//!
//! The binary wires four subsystems: the configuration backend
//! (`gatehouse-backend`), the declarative policy (`gatehouse-policy`), the
//! in-process CA (`gatehouse-ca`), and the packet-filter reconciler
//! (`gatehouse-fw`). This crate adds the pieces that tie them to the
//! daemon: the management-channel client, the user/key coordinator, and
//! the supervisor loop.

pub mod cli;
pub mod mgmt;
pub mod sessions;
pub mod supervisor;
pub mod users;
