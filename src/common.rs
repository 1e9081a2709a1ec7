//! Miscellaneous common structs used throughout the library.

mod family;
mod id;
pub mod link;
mod node;

pub use family::*;
pub use id::*;
pub use link::{lock, Link, Shared};
pub use node::*;
