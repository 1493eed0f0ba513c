//! Pluggable codec modules: ciphers, MACs, compression, and the key
//! exchange primitives the handshake uses to build them.

pub(crate) mod cipher;
pub(crate) mod compression;
pub(crate) mod exchange;
pub(crate) mod mac;
pub(crate) mod nonce;
pub(crate) mod padding;
pub(crate) mod suite;
