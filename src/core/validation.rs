use crate::core::Block;
use crate::error::Result;
use crate::utils::current_unix_time;
use std::fmt;

/// Named reason a block or transaction was refused. The display strings are
/// the ones reported to peers and written to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    // block
    WrongData,
    TooBigBlock,
    WrongVersion,
    WrongHash,
    WrongPrevBlock,
    WrongTime,
    WrongDiff,
    TooEasyHash,
    WrongTx { index: usize, reason: Box<Rejection> },
    // transaction
    TooBigTx,
    FirstTxHasIn,
    FirstTxHasExtraOrNoOut,
    TxWithOutNotExists,
    OutNotExists,
    DoubleSpendInOneTx,
    DoubleSpendInOneBlock,
    OutIsSpent,
    WrongKeyId,
    PublicKeyNotMatchesAddress,
    WrongSignOfIn,
    WrongAddressAtOut,
    WrongAmountAtOut,
    WrongAmountOfReward,
    WrongFee,
    // free transaction admission
    KnownTx,
    OutIsSpentByFreeTx,
    TooSmallFee,
}

impl Rejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::WrongData => "Wrong data",
            Rejection::TooBigBlock => "Too big block",
            Rejection::WrongVersion => "Wrong version",
            Rejection::WrongHash => "Wrong hash",
            Rejection::WrongPrevBlock => "Wrong prevBlock",
            Rejection::WrongTime => "Wrong time",
            Rejection::WrongDiff => "Wrong diff",
            Rejection::TooEasyHash => "Too easy hash",
            Rejection::WrongTx { .. } => "Wrong tx",
            Rejection::TooBigTx => "Too big tx",
            Rejection::FirstTxHasIn => "First tx has IN",
            Rejection::FirstTxHasExtraOrNoOut => "First tx has extra or no OUT",
            Rejection::TxWithOutNotExists => "Tx with OUT not exists",
            Rejection::OutNotExists => "OUT not exists",
            Rejection::DoubleSpendInOneTx => "Double spend in one tx",
            Rejection::DoubleSpendInOneBlock => "Double spend in one block",
            Rejection::OutIsSpent => "OUT is spent",
            Rejection::WrongKeyId => "Wrong key id",
            Rejection::PublicKeyNotMatchesAddress => "Public key not matches address",
            Rejection::WrongSignOfIn => "Wrong sign of IN",
            Rejection::WrongAddressAtOut => "Wrong address at OUT",
            Rejection::WrongAmountAtOut => "Wrong amount at OUT",
            Rejection::WrongAmountOfReward => "Wrong amount of reward",
            Rejection::WrongFee => "Wrong fee",
            Rejection::KnownTx => "Known tx",
            Rejection::OutIsSpentByFreeTx => "OUT is spent by free tx",
            Rejection::TooSmallFee => "Too small fee",
        }
    }

    /// Innermost reason, looking through `WrongTx` wrappers
    pub fn root(&self) -> &Rejection {
        match self {
            Rejection::WrongTx { reason, .. } => reason.root(),
            other => other,
        }
    }

    pub(crate) fn in_tx(self, index: usize) -> Rejection {
        Rejection::WrongTx {
            index,
            reason: Box::new(self),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::WrongTx { index, reason } => write!(f, "Wrong tx #{index}: {reason}"),
            other => f.write_str(other.reason()),
        }
    }
}

/// Environment a validation run is evaluated in.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext {
    /// Local clock, unix seconds
    pub now: u64,
    /// Skip transaction checks; only used while catching up for the first time
    pub promiscuous: bool,
}

impl ValidationContext {
    pub fn new(now: u64) -> ValidationContext {
        ValidationContext {
            now,
            promiscuous: false,
        }
    }

    pub fn current() -> Result<ValidationContext> {
        Ok(Self::new(current_unix_time()?))
    }

    pub fn with_promiscuous(mut self, promiscuous: bool) -> ValidationContext {
        self.promiscuous = promiscuous;
        self
    }
}

/// How a transaction is being validated.
#[derive(Clone, Copy)]
pub enum TxRole<'a> {
    /// Unconfirmed transaction offered to the free pool
    Free,
    /// Regular transaction at position `index` of a candidate block
    InBlock { block: &'a Block, index: usize },
    /// Transaction 0 of a block, paying subsidy plus `fees`
    Coinbase { fees: u64 },
}

impl TxRole<'_> {
    pub fn is_coinbase(&self) -> bool {
        matches!(self, TxRole::Coinbase { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_strings() {
        assert_eq!(Rejection::WrongPrevBlock.to_string(), "Wrong prevBlock");
        assert_eq!(Rejection::OutIsSpent.to_string(), "OUT is spent");
        assert_eq!(
            Rejection::WrongAmountOfReward.reason(),
            "Wrong amount of reward"
        );
    }

    #[test]
    fn test_wrong_tx_wraps_inner_reason() {
        let rejection = Rejection::WrongSignOfIn.in_tx(2);
        assert_eq!(rejection.reason(), "Wrong tx");
        assert_eq!(rejection.to_string(), "Wrong tx #2: Wrong sign of IN");
        assert_eq!(rejection.root(), &Rejection::WrongSignOfIn);
    }
}
