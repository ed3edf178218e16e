//! Utility functions and helpers
//!
//! Cryptographic wrappers, the big-endian byte reader used by the wire
//! codecs, and the bincode layer used by the secondary index.

pub mod crypto;
pub mod encoding;
pub mod serialization;

pub use crypto::{
    base58_decode, base58_encode, current_unix_time, double_sha256, ecdsa_p256_sha256_sign_digest,
    ecdsa_p256_sha256_sign_verify, new_key_pair, ripemd160_digest, sha256_digest,
};
pub use encoding::ByteReader;
pub use serialization::{decode_index_value, encode_index_value};
