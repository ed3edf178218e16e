use crate::error::{BlockchainError, Result};
use crate::utils::{base58_decode, base58_encode, ripemd160_digest, sha256_digest};
use std::fmt;
use std::str::FromStr;

/// Group id written in front of every address this node creates
pub const DEFAULT_GROUP: u8 = 0x00;
pub const ADDRESS_CHECK_SUM_LEN: usize = 4;
pub const PUB_KEY_HASH_LEN: usize = 20;
/// group id + public key hash + checksum
pub const ADDRESS_LEN: usize = 1 + PUB_KEY_HASH_LEN + ADDRESS_CHECK_SUM_LEN;

/// Raw 25-byte destination address as stored in transaction outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    pub fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Address {
        Address(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Address> {
        let raw: [u8; ADDRESS_LEN] = bytes.try_into().map_err(|_| {
            BlockchainError::InvalidAddress(format!(
                "expected {ADDRESS_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Address(raw))
    }

    pub fn from_public_key(public_key: &[u8]) -> Address {
        Self::from_pub_key_hash(DEFAULT_GROUP, &hash_pub_key(public_key))
    }

    pub fn from_pub_key_hash(group: u8, pub_key_hash: &[u8]) -> Address {
        let mut raw = [0u8; ADDRESS_LEN];
        raw[0] = group;
        raw[1..1 + PUB_KEY_HASH_LEN].copy_from_slice(&pub_key_hash[..PUB_KEY_HASH_LEN]);
        let checksum = checksum(&raw[..1 + PUB_KEY_HASH_LEN]);
        raw[1 + PUB_KEY_HASH_LEN..].copy_from_slice(&checksum);
        Address(raw)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn get_group(&self) -> u8 {
        self.0[0]
    }

    pub fn get_pub_key_hash(&self) -> &[u8] {
        &self.0[1..1 + PUB_KEY_HASH_LEN]
    }

    /// Checksum over group id and key hash must match the trailing four bytes
    pub fn is_valid(&self) -> bool {
        checksum(&self.0[..1 + PUB_KEY_HASH_LEN])[..] == self.0[1 + PUB_KEY_HASH_LEN..]
    }

    pub fn to_base58(&self) -> String {
        base58_encode(&self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl FromStr for Address {
    type Err = BlockchainError;

    fn from_str(s: &str) -> Result<Address> {
        let address = Address::from_slice(&base58_decode(s)?)?;
        if !address.is_valid() {
            return Err(BlockchainError::InvalidAddress(format!("bad checksum: {s}")));
        }
        Ok(address)
    }
}

pub fn hash_pub_key(pub_key: &[u8]) -> Vec<u8> {
    let pub_key_sha256 = sha256_digest(pub_key);
    ripemd160_digest(pub_key_sha256.as_slice())
}

fn checksum(payload: &[u8]) -> [u8; ADDRESS_CHECK_SUM_LEN] {
    let first_sha = sha256_digest(payload);
    let second_sha = sha256_digest(first_sha.as_slice());
    let mut out = [0u8; ADDRESS_CHECK_SUM_LEN];
    out.copy_from_slice(&second_sha[..ADDRESS_CHECK_SUM_LEN]);
    out
}

pub fn validate_address(address: &str) -> bool {
    address.parse::<Address>().is_ok()
}
