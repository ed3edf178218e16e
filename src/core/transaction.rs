// Transactions move value between addresses. Inputs point at earlier
// outputs and prove ownership with a signature, outputs lock value to an
// address. The wire layout is:
//
//   hash(32) | time(8) | keyCount(4) | inCount(4) | outCount(4)
//   | publicKey(65) x keyCount
//   | {refTxHash(32) refOut(4) keyId(4) sigLen(1) sig} x inCount
//   | {address(25) value(8)} x outCount
//
// Everything after the hash is the "raw" form stored inside blocks. The hash
// is SHA-256 twice over the raw bytes.

use crate::core::{Hash32, Rejection, TxRole, ValidationContext};
use crate::error::{BlockchainError, Result};
use crate::storage::record_store::{
    FixedRecord, FixedRecordStore, ScalableRecord, ScalableRecordStore,
};
use crate::storage::Ledger;
use crate::utils::{double_sha256, ecdsa_p256_sha256_sign_verify, ByteReader};
use crate::wallet::{Address, Wallet, ADDRESS_LEN, PUBLIC_KEY_LEN};
use data_encoding::HEXLOWER;
use once_cell::sync::OnceCell;
use std::collections::HashSet;
use std::fmt;

/// Largest serialized transaction accepted
pub const MAX_TX_SIZE: usize = 786_432;
/// Tolerated clock drift into the future, in seconds
pub const MAX_FUTURE_DRIFT_SECS: u64 = 60;

const TX_HEADER_LENGTH: usize = 8 + 4 + 4 + 4;

pub type PublicKey = [u8; PUBLIC_KEY_LEN];

impl FixedRecord for PublicKey {
    const SIZE: usize = PUBLIC_KEY_LEN;

    fn write_to(&self, out: &mut [u8]) {
        out[..PUBLIC_KEY_LEN].copy_from_slice(self);
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut key = [0u8; PUBLIC_KEY_LEN];
        key.copy_from_slice(&bytes[..PUBLIC_KEY_LEN]);
        key
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub ref_tx_hash: Hash32,
    pub ref_out: u32,
    pub key_id: u32,
    pub signature: Vec<u8>,
}

impl ScalableRecord for TxInput {
    fn encoded_len(&self) -> usize {
        32 + 4 + 4 + 1 + self.signature.len()
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ref_tx_hash);
        out.extend_from_slice(&self.ref_out.to_be_bytes());
        out.extend_from_slice(&self.key_id.to_be_bytes());
        out.push(self.signature.len() as u8);
        out.extend_from_slice(&self.signature);
    }

    fn read_from(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let input = Self::read(&mut reader)?;
        if reader.remaining() != 0 {
            return Err(BlockchainError::Serialization(
                "trailing bytes after input".to_string(),
            ));
        }
        Ok(input)
    }
}

impl TxInput {
    fn read(reader: &mut ByteReader<'_>) -> Result<TxInput> {
        let ref_tx_hash = reader.read_array::<32>()?;
        let ref_out = reader.read_u32()?;
        let key_id = reader.read_u32()?;
        let sig_len = reader.read_u8()? as usize;
        let signature = reader.read_slice(sig_len)?.to_vec();
        Ok(TxInput {
            ref_tx_hash,
            ref_out,
            key_id,
            signature,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOutput {
    pub address: Address,
    pub value: u64,
}

impl FixedRecord for TxOutput {
    const SIZE: usize = ADDRESS_LEN + 8;

    fn write_to(&self, out: &mut [u8]) {
        out[..ADDRESS_LEN].copy_from_slice(self.address.as_bytes());
        out[ADDRESS_LEN..Self::SIZE].copy_from_slice(&self.value.to_be_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut address = [0u8; ADDRESS_LEN];
        address.copy_from_slice(&bytes[..ADDRESS_LEN]);
        let mut value = [0u8; 8];
        value.copy_from_slice(&bytes[ADDRESS_LEN..Self::SIZE]);
        TxOutput {
            address: Address::from_bytes(address),
            value: u64::from_be_bytes(value),
        }
    }
}

#[derive(Clone)]
pub struct Transaction {
    time: u64,
    keys: FixedRecordStore<PublicKey>,
    inputs: ScalableRecordStore<TxInput>,
    outputs: FixedRecordStore<TxOutput>,
    // hash received alongside raw bytes; validation compares it to the recomputed one
    claimed_hash: Option<Hash32>,
    hash: OnceCell<Hash32>,
    raw: OnceCell<Vec<u8>>,
}

impl Transaction {
    pub fn new(time: u64) -> Transaction {
        Transaction {
            time,
            keys: FixedRecordStore::with_step(2),
            inputs: ScalableRecordStore::new(),
            outputs: FixedRecordStore::with_step(2),
            claimed_hash: None,
            hash: OnceCell::new(),
            raw: OnceCell::new(),
        }
    }

    /// Single-output reward transaction
    pub fn new_coinbase(time: u64, address: Address, value: u64) -> Result<Transaction> {
        let mut tx = Transaction::new(time);
        tx.add_output(address, value)?;
        Ok(tx)
    }

    fn touch(&mut self) {
        self.claimed_hash = None;
        self.hash = OnceCell::new();
        self.raw = OnceCell::new();
    }

    /// Outputs are covered by every input signature, so all of them must be
    /// added before the first input.
    pub fn add_output(&mut self, address: Address, value: u64) -> Result<()> {
        if !self.inputs.is_empty() {
            return Err(BlockchainError::Transaction(
                "outputs cannot be added after inputs are signed".to_string(),
            ));
        }
        self.outputs.push(&TxOutput { address, value });
        self.touch();
        Ok(())
    }

    /// Spends output `ref_out` of `ref_tx_hash`, signing with `wallet`
    pub fn add_input(&mut self, ref_tx_hash: Hash32, ref_out: u32, wallet: &Wallet) -> Result<()> {
        let public_key = *wallet.get_public_key();
        let key_id = match self.keys.position(|key| *key == public_key) {
            Some(index) => index,
            None => {
                self.keys.push(&public_key);
                self.keys.len() - 1
            }
        };
        let signature = wallet.sign(&self.signing_message(&ref_tx_hash, ref_out))?;
        if signature.len() > u8::MAX as usize {
            return Err(BlockchainError::Crypto(format!(
                "signature of {} bytes does not fit the length byte",
                signature.len()
            )));
        }
        self.inputs.push(&TxInput {
            ref_tx_hash,
            ref_out,
            key_id: key_id as u32,
            signature,
        })?;
        self.touch();
        Ok(())
    }

    /// Bytes an input signature covers: referenced hash, output index and
    /// the serialized outputs of this transaction
    pub fn signing_message(&self, ref_tx_hash: &Hash32, ref_out: u32) -> Vec<u8> {
        let outputs = self.outputs.as_bytes();
        let mut message = Vec::with_capacity(32 + 4 + outputs.len());
        message.extend_from_slice(ref_tx_hash);
        message.extend_from_slice(&ref_out.to_be_bytes());
        message.extend_from_slice(outputs);
        message
    }

    pub fn get_time(&self) -> u64 {
        self.time
    }

    pub fn get_keys(&self) -> impl Iterator<Item = PublicKey> + '_ {
        self.keys.iter()
    }

    pub fn get_inputs(&self) -> impl DoubleEndedIterator<Item = TxInput> + '_ {
        self.inputs.iter()
    }

    pub fn get_outputs(&self) -> impl DoubleEndedIterator<Item = TxOutput> + '_ {
        self.outputs.iter()
    }

    pub fn get_output(&self, index: u32) -> Option<TxOutput> {
        self.outputs.get(index as usize)
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_coinbase_shaped(&self) -> bool {
        self.inputs.is_empty() && self.outputs.len() == 1
    }

    /// Whether any input references output `out` of `tx_hash`
    pub fn spends(&self, tx_hash: &Hash32, out: u32) -> bool {
        self.inputs
            .iter()
            .any(|input| input.ref_tx_hash == *tx_hash && input.ref_out == out)
    }

    pub fn raw(&self) -> &[u8] {
        self.raw.get_or_init(|| self.encode())
    }

    pub fn raw_len(&self) -> usize {
        self.raw().len()
    }

    fn encode(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(
            TX_HEADER_LENGTH
                + self.keys.as_bytes().len()
                + self.inputs.as_bytes().len()
                + self.outputs.as_bytes().len(),
        );
        raw.extend_from_slice(&self.time.to_be_bytes());
        raw.extend_from_slice(&(self.keys.len() as u32).to_be_bytes());
        raw.extend_from_slice(&(self.inputs.len() as u32).to_be_bytes());
        raw.extend_from_slice(&(self.outputs.len() as u32).to_be_bytes());
        raw.extend_from_slice(self.keys.as_bytes());
        for input in self.inputs.iter() {
            input.write_to(&mut raw);
        }
        raw.extend_from_slice(self.outputs.as_bytes());
        raw
    }

    /// Hash over the current contents, ignoring any hash received with the bytes
    pub fn compute_hash(&self) -> Hash32 {
        *self.hash.get_or_init(|| double_sha256(self.raw()))
    }

    pub fn hash(&self) -> Hash32 {
        self.claimed_hash.unwrap_or_else(|| self.compute_hash())
    }

    pub fn hash_hex(&self) -> String {
        HEXLOWER.encode(&self.hash())
    }

    /// `hash | raw`
    pub fn to_wire(&self) -> Vec<u8> {
        let raw = self.raw();
        let mut wire = Vec::with_capacity(32 + raw.len());
        wire.extend_from_slice(&self.hash());
        wire.extend_from_slice(raw);
        wire
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Transaction> {
        if bytes.len() < 32 {
            return Err(Rejection::WrongData.into());
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[..32]);
        Self::from_raw(Some(hash), &bytes[32..])
    }

    /// Rebuilds a transaction from its raw form. Malformed bytes are a
    /// `Wrong data` rejection.
    pub fn from_raw(hash: Option<Hash32>, raw: &[u8]) -> Result<Transaction> {
        Self::decode(hash, raw).map_err(|e| match e {
            BlockchainError::Serialization(_) => BlockchainError::Consensus(Rejection::WrongData),
            other => other,
        })
    }

    fn decode(hash: Option<Hash32>, raw: &[u8]) -> Result<Transaction> {
        let mut reader = ByteReader::new(raw);
        let time = reader.read_u64()?;
        let key_count = reader.read_u32()? as usize;
        let in_count = reader.read_u32()? as usize;
        let out_count = reader.read_u32()? as usize;

        let mut tx = Transaction::new(time);
        let key_bytes = reader.read_slice(key_count.saturating_mul(PUBLIC_KEY_LEN))?;
        tx.keys = FixedRecordStore::from_bytes(key_bytes)?;
        for _ in 0..in_count {
            tx.inputs.push(&TxInput::read(&mut reader)?)?;
        }
        let output_bytes = reader.read_slice(out_count.saturating_mul(TxOutput::SIZE))?;
        tx.outputs = FixedRecordStore::from_bytes(output_bytes)?;
        if reader.remaining() != 0 {
            return Err(BlockchainError::Serialization(format!(
                "{} trailing bytes after transaction",
                reader.remaining()
            )));
        }
        tx.claimed_hash = hash;
        let _ = tx.raw.set(raw.to_vec());
        Ok(tx)
    }

    /// Checks this transaction against the ledger as of block `ref_id`
    /// (`None` for an empty ledger). Returns the fee it pays; a coinbase
    /// returns 0.
    pub fn validate_after(
        &self,
        ledger: &Ledger,
        ref_id: Option<u32>,
        role: TxRole<'_>,
        ctx: &ValidationContext,
        allowable: usize,
    ) -> Result<u64> {
        if self.raw_len() > MAX_TX_SIZE {
            return Err(Rejection::TooBigTx.into());
        }
        if role.is_coinbase() {
            if !self.inputs.is_empty() {
                return Err(Rejection::FirstTxHasIn.into());
            }
            if self.outputs.len() != 1 {
                return Err(Rejection::FirstTxHasExtraOrNoOut.into());
            }
        }
        if self.time > ctx.now + MAX_FUTURE_DRIFT_SECS {
            return Err(Rejection::WrongTime.into());
        }
        let own_hash = self.compute_hash();
        if own_hash != self.hash() {
            return Err(Rejection::WrongHash.into());
        }

        let mut in_sum: u128 = 0;
        let mut referenced = HashSet::new();
        for input in self.inputs.iter() {
            let ref_tx = match ref_id {
                Some(as_of) => ledger.find_transaction(&input.ref_tx_hash, as_of, allowable)?,
                None => None,
            };
            let ref_tx = ref_tx.ok_or(Rejection::TxWithOutNotExists)?;
            let ref_output = ref_tx
                .get_output(input.ref_out)
                .ok_or(Rejection::OutNotExists)?;
            if !referenced.insert((input.ref_tx_hash, input.ref_out)) {
                return Err(Rejection::DoubleSpendInOneTx.into());
            }
            if let TxRole::InBlock { block, index } = role {
                let spent_elsewhere = block
                    .get_transactions()
                    .iter()
                    .enumerate()
                    .any(|(i, other)| i != index && other.spends(&input.ref_tx_hash, input.ref_out));
                if spent_elsewhere {
                    return Err(Rejection::DoubleSpendInOneBlock.into());
                }
            }
            if let Some(as_of) = ref_id {
                if ledger
                    .is_output_spent(&input.ref_tx_hash, input.ref_out, as_of, allowable)?
                    .is_some()
                {
                    return Err(Rejection::OutIsSpent.into());
                }
            }
            let public_key = self
                .keys
                .get(input.key_id as usize)
                .ok_or(Rejection::WrongKeyId)?;
            if Address::from_public_key(&public_key) != ref_output.address {
                return Err(Rejection::PublicKeyNotMatchesAddress.into());
            }
            let message = self.signing_message(&input.ref_tx_hash, input.ref_out);
            if !ecdsa_p256_sha256_sign_verify(&public_key, &input.signature, &message) {
                return Err(Rejection::WrongSignOfIn.into());
            }
            in_sum += u128::from(ref_output.value);
        }

        let mut out_sum: u128 = 0;
        for output in self.outputs.iter() {
            if !output.address.is_valid() {
                return Err(Rejection::WrongAddressAtOut.into());
            }
            if output.value == 0 {
                return Err(Rejection::WrongAmountAtOut.into());
            }
            out_sum += u128::from(output.value);
        }

        if let TxRole::Coinbase { fees } = role {
            let block_id = ref_id.map_or(0, |id| id + 1);
            let expected =
                u128::from(crate::core::monetary::block_subsidy(block_id)) + u128::from(fees);
            if out_sum != expected {
                return Err(Rejection::WrongAmountOfReward.into());
            }
            return Ok(0);
        }
        if in_sum < out_sum {
            return Err(Rejection::WrongFee.into());
        }
        u64::try_from(in_sum - out_sum).map_err(|_| Rejection::WrongFee.into())
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash() && self.raw() == other.raw()
    }
}

impl Eq for Transaction {}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("hash", &self.hash_hex())
            .field("time", &self.time)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx(wallet: &Wallet) -> Transaction {
        let mut tx = Transaction::new(1_700_000_000);
        tx.add_output(wallet.get_address(), 1_000).unwrap();
        tx.add_output(Address::from_public_key(&[9u8; 65]), 2_000).unwrap();
        tx.add_input([1u8; 32], 0, wallet).unwrap();
        tx.add_input([2u8; 32], 3, wallet).unwrap();
        tx
    }

    #[test]
    fn test_raw_layout() {
        let wallet = Wallet::new().unwrap();
        let tx = sample_tx(&wallet);
        let raw = tx.raw();
        assert_eq!(&raw[..8], &1_700_000_000u64.to_be_bytes());
        assert_eq!(&raw[8..12], &1u32.to_be_bytes()); // one distinct key
        assert_eq!(&raw[12..16], &2u32.to_be_bytes());
        assert_eq!(&raw[16..20], &2u32.to_be_bytes());
        assert_eq!(&raw[20..85], wallet.get_public_key());
        // outputs close the transaction
        let outputs_start = raw.len() - 2 * TxOutput::SIZE;
        assert_eq!(&raw[outputs_start..], tx.outputs.as_bytes());
    }

    #[test]
    fn test_roundtrip_preserves_hash_and_fields() {
        let wallet = Wallet::new().unwrap();
        let tx = sample_tx(&wallet);
        let restored = Transaction::from_wire(&tx.to_wire()).unwrap();
        assert_eq!(restored, tx);
        assert_eq!(restored.compute_hash(), tx.hash());
        assert_eq!(restored.get_time(), tx.get_time());
        assert_eq!(
            restored.get_inputs().collect::<Vec<_>>(),
            tx.get_inputs().collect::<Vec<_>>()
        );
        assert_eq!(restored.get_output(1), tx.get_output(1));
        assert_eq!(restored.get_output(2), None);
    }

    #[test]
    fn test_empty_transaction_roundtrip() {
        let tx = Transaction::new(0);
        assert_eq!(tx.raw_len(), TX_HEADER_LENGTH);
        let restored = Transaction::from_raw(None, tx.raw()).unwrap();
        assert_eq!(restored.hash(), tx.hash());
        assert!(!restored.is_coinbase_shaped());
    }

    #[test]
    fn test_hash_is_deterministic_and_tracks_changes() {
        let address = Address::from_public_key(&[3u8; 65]);
        let a = Transaction::new_coinbase(10, address, 50).unwrap();
        let b = Transaction::new_coinbase(10, address, 50).unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash(), double_sha256(a.raw()));

        let mut c = Transaction::new_coinbase(10, address, 50).unwrap();
        c.add_output(address, 1).unwrap();
        assert_ne!(c.hash(), a.hash());
    }

    #[test]
    fn test_outputs_after_inputs_rejected() {
        let wallet = Wallet::new().unwrap();
        let mut tx = sample_tx(&wallet);
        assert!(tx.add_output(wallet.get_address(), 1).is_err());
    }

    #[test]
    fn test_input_signature_covers_outputs() {
        let wallet = Wallet::new().unwrap();
        let tx = sample_tx(&wallet);
        let input = tx.get_inputs().next().unwrap();
        let message = tx.signing_message(&input.ref_tx_hash, input.ref_out);
        assert!(ecdsa_p256_sha256_sign_verify(
            wallet.get_public_key(),
            &input.signature,
            &message
        ));
        let mut other_message = message.clone();
        *other_message.last_mut().unwrap() ^= 1;
        assert!(!ecdsa_p256_sha256_sign_verify(
            wallet.get_public_key(),
            &input.signature,
            &other_message
        ));
    }

    #[test]
    fn test_malformed_raw_is_wrong_data() {
        let wallet = Wallet::new().unwrap();
        let tx = sample_tx(&wallet);
        let raw = tx.raw();
        let truncated = Transaction::from_raw(None, &raw[..raw.len() - 1]);
        assert!(matches!(
            truncated,
            Err(BlockchainError::Consensus(Rejection::WrongData))
        ));
        let mut extended = raw.to_vec();
        extended.push(0);
        assert!(Transaction::from_raw(None, &extended).is_err());
        assert!(Transaction::from_wire(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_claimed_hash_is_kept() {
        let tx = Transaction::new_coinbase(1, Address::from_public_key(&[1u8; 65]), 5).unwrap();
        let restored = Transaction::from_raw(Some([7u8; 32]), tx.raw()).unwrap();
        assert_eq!(restored.hash(), [7u8; 32]);
        assert_eq!(restored.compute_hash(), tx.hash());
    }

    #[test]
    fn test_spends() {
        let wallet = Wallet::new().unwrap();
        let tx = sample_tx(&wallet);
        assert!(tx.spends(&[1u8; 32], 0));
        assert!(tx.spends(&[2u8; 32], 3));
        assert!(!tx.spends(&[2u8; 32], 0));
    }
}
