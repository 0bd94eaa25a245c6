//! Architecture-specific parts of the allocator.

pub mod arm64;
