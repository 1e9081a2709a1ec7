#![doc = include_str!("../README.md")]

// Public modules
pub mod commands;
pub mod common;
pub mod config;
pub mod host;
pub mod messages;
pub mod registry;
pub mod routing_table;
pub mod server;
pub mod setup;
pub mod state;
pub mod tasks;
pub mod transport;
pub mod udp_tracker;

mod error;

pub use crate::common::{Family, Id, LocalNode, Node, AF_INET, AF_INET6};
pub use commands::{Command, CommandKind, Trigger};
pub use config::{Config, EntryPoint, FamilyConfig};
pub use error::{Error, Result};
pub use host::Host;
pub use registry::{FamilyStack, Registry, SlotState};
pub use setup::DhtSetup;
