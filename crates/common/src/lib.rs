//! Weftnet common library
//!
//! Shared between the registry and the node: the bit-string prefix
//! type, X.509 identity helpers, registry wire types and errors.

pub mod crypto;
pub mod error;
pub mod prefix;
pub mod wire;

pub use error::{Error, Result};
pub use prefix::{Network, Prefix};
