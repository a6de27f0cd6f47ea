//! Transaction proposals as exchanged between sender and receiver.

use std::collections::HashSet;
use std::fmt;

use bitcoin::psbt::Psbt;
use bitcoin::{psbt, Amount, OutPoint, SignedAmount, Transaction, TxOut};

use crate::psbt::{InconsistentPsbt, PsbtExt, PsbtInputsError};

/// An unspent output owned by the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub txout: TxOut,
    /// Full transaction that created the output, when known.
    pub previous_tx: Option<Transaction>,
}

impl Utxo {
    pub fn new(outpoint: OutPoint, txout: TxOut) -> Self { Self { outpoint, txout, previous_tx: None } }

    /// Build a [`Utxo`] for output `vout` of `tx`, keeping `tx` as the previous transaction.
    pub fn from_transaction(tx: Transaction, vout: u32) -> Option<Self> {
        let txout = tx.output.get(usize::try_from(vout).ok()?)?.clone();
        let outpoint = OutPoint { txid: tx.compute_txid(), vout };
        Some(Self { outpoint, txout, previous_tx: Some(tx) })
    }

    pub fn with_previous_tx(mut self, tx: Transaction) -> Self {
        self.previous_tx = Some(tx);
        self
    }

    pub fn amount(&self) -> Amount { self.txout.value }

    pub(crate) fn to_psbt_input(&self) -> psbt::Input {
        psbt::Input {
            witness_utxo: Some(self.txout.clone()),
            non_witness_utxo: self.previous_tx.clone(),
            ..Default::default()
        }
    }
}

/// A structurally sound PSBT.
///
/// Every input resolves to a previous output with a positive amount, outpoints are unique and
/// all amounts are within the money range. The totals are computed once on construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    psbt: Psbt,
    prevouts: Vec<TxOut>,
    total_input: Amount,
    total_output: Amount,
}

impl Proposal {
    pub fn from_psbt(psbt: Psbt) -> Result<Self, ProposalError> {
        let psbt = psbt.validate().map_err(ProposalError::Inconsistent)?;
        if psbt.unsigned_tx.input.is_empty() {
            return Err(ProposalError::NoInputs);
        }
        if psbt.unsigned_tx.output.is_empty() {
            return Err(ProposalError::NoOutputs);
        }
        psbt.validate_input_utxos().map_err(ProposalError::InvalidInput)?;
        let prevouts = psbt
            .input_pairs()
            .enumerate()
            .map(|(index, pair)| {
                pair.previous_txout()
                    .cloned()
                    .map_err(|e| ProposalError::InvalidInput(PsbtInputsError::new(index, e.into())))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let total_input = total_input_value(
            psbt.unsigned_tx.input.iter().map(|txin| txin.previous_output).zip(&prevouts),
        )?;
        let total_output = total_output_value(&psbt.unsigned_tx.output)?;
        Ok(Self { psbt, prevouts, total_input, total_output })
    }

    pub fn psbt(&self) -> &Psbt { &self.psbt }

    pub fn into_psbt(self) -> Psbt { self.psbt }

    pub fn unsigned_tx(&self) -> &Transaction { &self.psbt.unsigned_tx }

    /// Outpoints spent by this proposal paired with the outputs they spend, in input order.
    pub fn inputs(&self) -> impl Iterator<Item = (OutPoint, &TxOut)> + '_ {
        self.psbt.unsigned_tx.input.iter().map(|txin| txin.previous_output).zip(&self.prevouts)
    }

    pub fn outpoints(&self) -> impl Iterator<Item = OutPoint> + '_ {
        self.psbt.unsigned_tx.input.iter().map(|txin| txin.previous_output)
    }

    pub fn outputs(&self) -> &[TxOut] { &self.psbt.unsigned_tx.output }

    pub fn previous_txout(&self, outpoint: &OutPoint) -> Option<&TxOut> {
        self.inputs().find(|(op, _)| op == outpoint).map(|(_, txout)| txout)
    }

    pub fn contains_outpoint(&self, outpoint: &OutPoint) -> bool {
        self.outpoints().any(|op| &op == outpoint)
    }

    pub fn total_input(&self) -> Amount { self.total_input }

    pub fn total_output(&self) -> Amount { self.total_output }

    /// Total input minus total output. Negative when the outputs overspend.
    pub fn fee(&self) -> SignedAmount {
        // both totals are capped at MAX_MONEY so the conversions cannot overflow
        SignedAmount::from_sat(self.total_input.to_sat() as i64)
            - SignedAmount::from_sat(self.total_output.to_sat() as i64)
    }

    pub(crate) fn prevouts(&self) -> &[TxOut] { &self.prevouts }
}

/// Base64 encoding of the underlying PSBT.
impl fmt::Display for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { fmt::Display::fmt(&self.psbt, f) }
}

/// Sum of input amounts. Rejects zero amounts, repeated outpoints and overflow of the money range.
pub(crate) fn total_input_value<'a>(
    inputs: impl IntoIterator<Item = (OutPoint, &'a TxOut)>,
) -> Result<Amount, ProposalError> {
    let mut seen = HashSet::new();
    inputs.into_iter().try_fold(Amount::ZERO, |total, (outpoint, txout)| {
        if txout.value == Amount::ZERO {
            return Err(ProposalError::ZeroValueInput(outpoint));
        }
        if !seen.insert(outpoint) {
            return Err(ProposalError::DuplicateOutpoint(outpoint));
        }
        checked_money_add(total, txout.value)
    })
}

fn total_output_value(outputs: &[TxOut]) -> Result<Amount, ProposalError> {
    outputs.iter().try_fold(Amount::ZERO, |total, txout| checked_money_add(total, txout.value))
}

fn checked_money_add(total: Amount, value: Amount) -> Result<Amount, ProposalError> {
    total
        .checked_add(value)
        .filter(|sum| *sum <= Amount::MAX_MONEY)
        .ok_or(ProposalError::AmountOutOfRange)
}

/// A PSBT that cannot be treated as a transaction proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalError {
    Inconsistent(InconsistentPsbt),
    NoInputs,
    NoOutputs,
    InvalidInput(PsbtInputsError),
    ZeroValueInput(OutPoint),
    DuplicateOutpoint(OutPoint),
    AmountOutOfRange,
}

impl fmt::Display for ProposalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ProposalError::*;

        match self {
            Inconsistent(e) => write!(f, "inconsistent PSBT: {e}"),
            NoInputs => write!(f, "proposal has no inputs"),
            NoOutputs => write!(f, "proposal has no outputs"),
            InvalidInput(e) => write!(f, "{e}"),
            ZeroValueInput(outpoint) => write!(f, "input {outpoint} spends a zero value output"),
            DuplicateOutpoint(outpoint) => write!(f, "outpoint {outpoint} is spent more than once"),
            AmountOutOfRange => write!(f, "amounts exceed the maximum money supply"),
        }
    }
}

impl std::error::Error for ProposalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use ProposalError::*;

        match self {
            Inconsistent(e) => Some(e),
            InvalidInput(e) => Some(e),
            NoInputs | NoOutputs | ZeroValueInput(_) | DuplicateOutpoint(_) | AmountOutOfRange =>
                None,
        }
    }
}
