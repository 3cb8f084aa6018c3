//! Vrlab Virtual Appliance Launcher Base Crate
//!
//! This crate contains the boot-orchestration core used to provision
//! virtual network appliances over their serial console: the console
//! channel trait, the appliance profiles, the management-network
//! probe, the configuration script player, and the boot state
//! machine. It does not contain any hypervisor or transport
//! implementations; those are supplied by the launcher binaries.

pub mod boot;
pub mod config;
pub mod console;
pub mod probe;
pub mod profile;
pub mod script;
pub mod util;
