//! # Registry Domain Types
//!
//! Shared vocabulary of the registry core: content digests, manifest payloads of
//! the supported media types, manifest validation, and the domain error taxonomy.
//!
//! Backends build on these types; none of them perform I/O.
pub mod digest;
pub mod errors;
pub mod manifest;
pub mod names;

pub use digest::{Algorithm, Digest, Digester};
pub use errors::{Error, Result};
