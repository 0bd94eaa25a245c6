//! Control flow analyses the allocator depends on.
//!
//! The code generator may supply these through [`VCode::set_liveness`](crate::VCode::set_liveness)
//! and [`VCode::set_loops`](crate::VCode::set_loops); otherwise they are computed here.

pub mod liveness;
pub mod loops;
