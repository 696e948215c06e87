//! Host-side pieces linked into recompiled programs.

pub mod memory;

pub use memory::{guest_base, guest_limit, GUEST_ADDRESS_LIMIT};
