//! gz-fs shared library.

/// Caching primitives for gz-fs.
pub mod cache;
/// Filesystem service surface and FUSE adapter.
pub mod fs;
/// Metadata backends over block devices.
pub mod meta;
/// Block store over a compressed image.
pub mod store;
