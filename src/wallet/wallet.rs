use crate::error::{BlockchainError, Result};
use crate::wallet::Address;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};

/// Length of an uncompressed P-256 public key
pub const PUBLIC_KEY_LEN: usize = 65;

/// An in-memory signing key. Nothing here is ever written to disk.
#[derive(Clone)]
pub struct Wallet {
    pkcs8: Vec<u8>,
    public_key: [u8; PUBLIC_KEY_LEN],
}

impl Wallet {
    pub fn new() -> Result<Wallet> {
        let pkcs8 = crate::utils::new_key_pair()?;
        Self::from_pkcs8(pkcs8)
    }

    pub fn from_pkcs8(pkcs8: Vec<u8>) -> Result<Wallet> {
        let rng = SystemRandom::new();
        let key_pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
                .map_err(|e| {
                    BlockchainError::Crypto(format!("Failed to create key pair from PKCS8: {e}"))
                })?;
        let public_key: [u8; PUBLIC_KEY_LEN] =
            key_pair.public_key().as_ref().try_into().map_err(|_| {
                BlockchainError::Crypto("Public key is not uncompressed P-256".to_string())
            })?;
        Ok(Wallet { pkcs8, public_key })
    }

    pub fn get_address(&self) -> Address {
        Address::from_public_key(&self.public_key)
    }

    pub fn get_public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public_key
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        crate::utils::ecdsa_p256_sha256_sign_digest(&self.pkcs8, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ecdsa_p256_sha256_sign_verify;

    #[test]
    fn test_wallet_address_matches_public_key() {
        let wallet = Wallet::new().unwrap();
        assert_eq!(
            wallet.get_address(),
            Address::from_public_key(wallet.get_public_key())
        );
        assert!(wallet.get_address().is_valid());
    }

    #[test]
    fn test_wallet_signature_verifies() {
        let wallet = Wallet::new().unwrap();
        let signature = wallet.sign(b"payload").unwrap();
        assert!(signature.len() <= u8::MAX as usize);
        assert!(ecdsa_p256_sha256_sign_verify(
            wallet.get_public_key(),
            &signature,
            b"payload"
        ));
    }
}
