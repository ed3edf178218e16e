//! Keys and addresses
//!
//! Address derivation and checksum validation, plus a throwaway signing key
//! used by miners, tests and the `newaddress` command.

pub mod address;
#[allow(clippy::module_inception)]
pub mod wallet;

pub use address::{
    hash_pub_key, validate_address, Address, ADDRESS_CHECK_SUM_LEN, ADDRESS_LEN, DEFAULT_GROUP,
};
pub use wallet::{Wallet, PUBLIC_KEY_LEN};
