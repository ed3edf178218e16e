// Bincode encoding of the values kept in the secondary transaction index
use crate::error::{BlockchainError, Result};
use bincode::{Decode, Encode};

pub fn encode_index_value<T: Encode>(value: &T) -> Result<Vec<u8>> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| BlockchainError::Serialization(format!("Failed to encode index value: {e}")))
}

/// Decodes a stored index value. The bytes must hold exactly one value.
pub fn decode_index_value<T: Decode<()>>(bytes: &[u8]) -> Result<T> {
    let (value, read) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| BlockchainError::Serialization(format!("Failed to decode index value: {e}")))?;
    if read != bytes.len() {
        return Err(BlockchainError::Serialization(format!(
            "Index value has {} trailing bytes",
            bytes.len() - read
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Encode, Decode)]
    struct SpentMark {
        block_id: u32,
        spent_at: Option<u32>,
    }

    #[test]
    fn test_index_value_round_trip() {
        let mark = SpentMark {
            block_id: 7,
            spent_at: Some(9),
        };
        let bytes = encode_index_value(&mark).unwrap();
        assert_eq!(decode_index_value::<SpentMark>(&bytes).unwrap(), mark);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode_index_value(&SpentMark {
            block_id: 1,
            spent_at: None,
        })
        .unwrap();
        bytes.push(0);
        assert!(matches!(
            decode_index_value::<SpentMark>(&bytes),
            Err(BlockchainError::Serialization(_))
        ));
    }

    #[test]
    fn test_truncated_value_rejected() {
        let bytes = encode_index_value(&SpentMark {
            block_id: 300,
            spent_at: Some(301),
        })
        .unwrap();
        assert!(decode_index_value::<SpentMark>(&bytes[..bytes.len() - 1]).is_err());
    }
}
