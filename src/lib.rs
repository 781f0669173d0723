//! SymCache Proxy - An HTTP caching proxy for debug-symbol transcoding.
//!
//! Clients request a SymCache artifact by format version, PDB name, id, and
//! age; the proxy serves it from a filesystem cache, remembers recent
//! failures, or drives an external transcoder to produce it.

pub mod cache;
pub mod config;
pub mod queue;
pub mod server;
pub mod symsrv;
pub mod transcode;
pub mod types;
