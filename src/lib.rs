//! SGP.22 Bound Profile Package secure channel
//!
//! Rust implementation of the BSP segment protection (AES-128-CBC + CMAC
//! chaining), the X9.63 session key derivation, Bound Profile Package
//! processing with PPK re-keying, and the certificate trust and ECDH/ECDSA
//! handshake primitives around it.

mod types;
mod tlv;
mod session;
mod kdf;
mod segment;
mod bsp;
mod replace_keys;
mod package;
mod processor;
mod keys;
mod signature;
mod certificate;
mod chain;
mod handshake;

pub use types::*;
pub use tlv::*;
pub use session::*;
pub use kdf::*;
pub use segment::*;
pub use bsp::*;
pub use replace_keys::*;
pub use package::*;
pub use processor::*;
pub use keys::*;
pub use signature::*;
pub use certificate::*;
pub use chain::*;
pub use handshake::*;
