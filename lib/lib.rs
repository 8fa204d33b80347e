//! mount0 shared library: composable storage backends exposed as one filesystem.

/// Mount descriptions and the provider graph builder.
pub mod config;
/// Provider contract, composition engines, leaf backends and the protocol bridge.
pub mod fs;
