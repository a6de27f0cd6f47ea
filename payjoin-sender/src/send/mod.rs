//! Send Payjoin
//!
//! This module contains types and methods used to implement the sending side of [BIP78
//! Payjoin](https://github.com/bitcoin/bips/blob/master/bip-0078.mediawiki).
//!
//! Usage is pretty simple:
//!
//! 1. Construct an [`OriginalProposal`] from your UTXOs with [`SenderBuilder`]
//! 2. Extract a [`Request`](crate::Request) with [`OriginalProposal::extract_request`], send
//!    it to the receiver and feed the reply to [`OriginalProposal::process_response`] (or let
//!    [`crate::io::negotiate`] do both)
//! 3. Check the counter-proposal with [`validate`]
//! 4. Sign and finalize the resulting [`PayjoinProposal`] with [`finalize`]
//! 5. Broadcast the [`SignedTransaction`]
//!
//! Any error is terminal for the attempt. The caller may start over with a fresh original
//! proposal or fall back to broadcasting the original with [`finalize_fallback`].

use bitcoin::absolute::LockTime;
use bitcoin::psbt::{self, Psbt};
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, Network, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::fee::{self, FeeParams};
use crate::proposal::{self, Proposal, Utxo};

mod error;
mod finalize;
mod negotiate;
mod validate;

#[cfg(feature = "io")]
pub(crate) use error::InternalMalformedResponse;
pub use error::{
    BroadcastError, BuildError, CreateRequestError, FinalizationError, MalformedResponse,
    NegotiationError, SigningError, ValidationError,
};
pub use finalize::{
    finalize, finalize_fallback, InputSignature, Sighash, SignRequest, SignedTransaction, Signer,
};
pub use validate::{validate, PayjoinProposal};

/// Number of outputs assumed when estimating the size of the original proposal.
const ESTIMATED_OUTPUTS: usize = 2;

#[derive(Debug, Clone)]
pub struct SenderBuilder {
    utxos: Vec<Utxo>,
    payee: ScriptBuf,
    amount: Amount,
    fee_params: FeeParams,
    change_script: Option<ScriptBuf>,
    network: Network,
}

impl SenderBuilder {
    /// Prepare an original proposal spending every one of `utxos` to pay `amount` to `payee`.
    pub fn new(utxos: Vec<Utxo>, payee: ScriptBuf, amount: Amount, fee_params: FeeParams) -> Self {
        Self { utxos, payee, amount, fee_params, change_script: None, network: Network::Bitcoin }
    }

    /// Like [`SenderBuilder::new`] but pays an address, which must belong to `network`.
    pub fn from_address(
        utxos: Vec<Utxo>,
        address: Address<bitcoin::address::NetworkUnchecked>,
        network: Network,
        amount: Amount,
        fee_params: FeeParams,
    ) -> Result<Self, BuildError> {
        let address = address
            .require_network(network)
            .map_err(|_| BuildError::AddressNetworkMismatch { network })?;
        Ok(Self::new(utxos, address.script_pubkey(), amount, fee_params).network(network))
    }

    /// Where change goes. Defaults to the script of the first UTXO.
    pub fn change_script(mut self, script: ScriptBuf) -> Self {
        self.change_script = Some(script);
        self
    }

    pub fn network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    pub fn build(self) -> Result<OriginalProposal, BuildError> {
        let Self { utxos, payee, amount, fee_params, change_script, network } = self;
        let first = utxos.first().ok_or(BuildError::NoUtxosAvailable)?;
        if fee_params.fee_rate_per_byte == 0 {
            return Err(BuildError::ZeroFeeRate);
        }
        if fee::is_dust(amount, fee_params.dust_threshold) {
            return Err(BuildError::PaymentBelowDust {
                amount,
                dust_threshold: fee_params.dust_threshold,
            });
        }
        let change_script = change_script.unwrap_or_else(|| first.txout.script_pubkey.clone());

        let available = proposal::total_input_value(utxos.iter().map(|u| (u.outpoint, &u.txout)))
            .map_err(BuildError::InvalidUtxo)?;
        let estimated_fee =
            fee::estimate_fee(utxos.len(), ESTIMATED_OUTPUTS, fee_params.fee_rate_per_byte)
                .checked_add(fee_params.max_additional_fee_contribution)
                .unwrap_or(Amount::MAX);
        let required = amount.checked_add(estimated_fee).unwrap_or(Amount::MAX);
        let Some(change) = available.checked_sub(required) else {
            return Err(BuildError::InsufficientFunds { available, required });
        };
        tracing::debug!(%available, %estimated_fee, %change, "estimated original proposal");

        let mut output = vec![TxOut { value: amount, script_pubkey: payee.clone() }];
        let change_index = if fee::is_dust(change, fee_params.dust_threshold) {
            tracing::debug!("change is dust, leaving it to the fee");
            None
        } else {
            output.push(TxOut { value: change, script_pubkey: change_script.clone() });
            Some(1)
        };

        let unsigned_tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: utxos
                .iter()
                .map(|utxo| TxIn {
                    previous_output: utxo.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
                .collect(),
            output,
        };
        let psbt = Psbt {
            inputs: utxos.iter().map(Utxo::to_psbt_input).collect(),
            outputs: vec![psbt::Output::default(); unsigned_tx.output.len()],
            unsigned_tx,
            version: 0,
            xpub: Default::default(),
            proprietary: Default::default(),
            unknown: Default::default(),
        };
        let proposal = Proposal::from_psbt(psbt).map_err(BuildError::InvalidUtxo)?;
        tracing::info!(
            inputs = utxos.len(),
            outputs = proposal.outputs().len(),
            fee = %proposal.fee(),
            "built original proposal"
        );
        Ok(OriginalProposal { proposal, payee, amount, change_index, change_script, fee_params, network })
    }
}

/// Build the original proposal paying `amount` to `payee`. See [`SenderBuilder`].
pub fn build(
    utxos: Vec<Utxo>,
    payee: ScriptBuf,
    amount: Amount,
    fee_params: FeeParams,
) -> Result<OriginalProposal, BuildError> {
    SenderBuilder::new(utxos, payee, amount, fee_params).build()
}

/// The sender authored proposal. Immutable once built.
#[derive(Debug, Clone)]
pub struct OriginalProposal {
    proposal: Proposal,
    payee: ScriptBuf,
    amount: Amount,
    change_index: Option<usize>,
    change_script: ScriptBuf,
    fee_params: FeeParams,
    network: Network,
}

impl OriginalProposal {
    pub fn proposal(&self) -> &Proposal { &self.proposal }

    pub fn psbt(&self) -> &Psbt { self.proposal.psbt() }

    pub fn payee(&self) -> &ScriptBuf { &self.payee }

    pub fn amount(&self) -> Amount { self.amount }

    /// Index of the sender's change output, if the proposal has one.
    pub fn change_index(&self) -> Option<usize> { self.change_index }

    pub fn change_output(&self) -> Option<&TxOut> {
        self.change_index.and_then(|i| self.proposal.outputs().get(i))
    }

    pub fn change_script(&self) -> &ScriptBuf { &self.change_script }

    pub fn fee_params(&self) -> &FeeParams { &self.fee_params }

    pub fn network(&self) -> Network { self.network }
}

#[cfg(test)]
mod test {
    use bitcoin::hashes::Hash;
    use bitcoin::{OutPoint, SignedAmount, Txid};

    use super::*;

    fn script(n: u8) -> ScriptBuf { ScriptBuf::new_p2wpkh(&bitcoin::WPubkeyHash::from_byte_array([n; 20])) }

    fn utxo(n: u8, sat: u64) -> Utxo {
        Utxo::new(
            OutPoint { txid: Txid::from_byte_array([n; 32]), vout: 0 },
            TxOut { value: Amount::from_sat(sat), script_pubkey: script(1) },
        )
    }

    fn params() -> FeeParams { FeeParams::new(10, Amount::from_sat(10_000)) }

    #[test]
    fn builds_payment_and_change() {
        let original =
            build(vec![utxo(1, 100_000)], script(9), Amount::from_sat(50_000), params()).unwrap();
        let tx = original.proposal().unsigned_tx();
        assert_eq!(tx.version, Version::TWO);
        assert_eq!(tx.lock_time, LockTime::ZERO);
        assert_eq!(tx.input[0].sequence, Sequence::ENABLE_RBF_NO_LOCKTIME);
        assert_eq!(tx.output[0], TxOut { value: Amount::from_sat(50_000), script_pubkey: script(9) });
        // 1 * 148 + 2 * 34 + 10 = 226 bytes at 10 sat/byte plus 10_000 contribution headroom
        assert_eq!(tx.output[1], TxOut { value: Amount::from_sat(37_740), script_pubkey: script(1) });
        assert_eq!(original.change_index(), Some(1));
        assert_eq!(original.proposal().fee(), SignedAmount::from_sat(12_260));
    }

    #[test]
    fn aggregates_every_utxo() {
        let original = build(
            vec![utxo(1, 40_000), utxo(2, 40_000), utxo(3, 40_000)],
            script(9),
            Amount::from_sat(50_000),
            params(),
        )
        .unwrap();
        assert_eq!(original.proposal().unsigned_tx().input.len(), 3);
        // 3 * 148 + 68 + 10 = 522 bytes
        assert_eq!(original.change_output().map(|o| o.value), Some(Amount::from_sat(54_780)));
    }

    #[test]
    fn dust_change_is_dropped() {
        // required = 50_000 + 12_260, leaving exactly the dust threshold
        let original =
            build(vec![utxo(1, 62_806)], script(9), Amount::from_sat(50_000), params()).unwrap();
        assert_eq!(original.change_index(), None);
        assert_eq!(original.proposal().outputs().len(), 1);
        assert_eq!(original.proposal().fee(), SignedAmount::from_sat(12_806));
    }

    #[test]
    fn change_above_dust_is_kept() {
        let original =
            build(vec![utxo(1, 62_807)], script(9), Amount::from_sat(50_000), params()).unwrap();
        assert_eq!(original.change_output().map(|o| o.value), Some(Amount::from_sat(547)));
    }

    #[test]
    fn custom_change_script() {
        let original =
            SenderBuilder::new(vec![utxo(1, 100_000)], script(9), Amount::from_sat(50_000), params())
                .change_script(script(5))
                .build()
                .unwrap();
        assert_eq!(original.change_output().map(|o| o.script_pubkey.clone()), Some(script(5)));
    }

    #[test]
    fn constraint_violations() {
        assert_eq!(
            build(vec![], script(9), Amount::from_sat(50_000), params()).unwrap_err(),
            BuildError::NoUtxosAvailable
        );
        assert_eq!(
            build(vec![utxo(1, 100_000)], script(9), Amount::from_sat(546), params()).unwrap_err(),
            BuildError::PaymentBelowDust {
                amount: Amount::from_sat(546),
                dust_threshold: fee::DUST_THRESHOLD
            }
        );
        assert_eq!(
            build(
                vec![utxo(1, 100_000)],
                script(9),
                Amount::from_sat(50_000),
                FeeParams::new(0, Amount::ZERO)
            )
            .unwrap_err(),
            BuildError::ZeroFeeRate
        );
    }

    #[test]
    fn insufficient_funds() {
        assert_eq!(
            build(vec![utxo(1, 62_259)], script(9), Amount::from_sat(50_000), params()).unwrap_err(),
            BuildError::InsufficientFunds {
                available: Amount::from_sat(62_259),
                required: Amount::from_sat(62_260)
            }
        );
    }

    #[test]
    fn invalid_utxos() {
        assert!(matches!(
            build(vec![utxo(1, 100_000), utxo(1, 100_000)], script(9), Amount::from_sat(50_000), params()),
            Err(BuildError::InvalidUtxo(proposal::ProposalError::DuplicateOutpoint(_)))
        ));
        assert!(matches!(
            build(vec![utxo(1, 0)], script(9), Amount::from_sat(50_000), params()),
            Err(BuildError::InvalidUtxo(proposal::ProposalError::ZeroValueInput(_)))
        ));
        let p2pkh = ScriptBuf::new_p2pkh(&bitcoin::PubkeyHash::from_byte_array([1; 20]));
        let legacy = Utxo::new(
            OutPoint { txid: Txid::from_byte_array([1; 32]), vout: 0 },
            TxOut { value: Amount::from_sat(100_000), script_pubkey: p2pkh },
        );
        assert!(matches!(
            build(vec![legacy], script(9), Amount::from_sat(50_000), params()),
            Err(BuildError::InvalidUtxo(proposal::ProposalError::InvalidInput(_)))
        ));
    }

    #[test]
    fn address_must_match_network() {
        let address: Address<bitcoin::address::NetworkUnchecked> =
            "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4".parse().unwrap();
        let err = SenderBuilder::from_address(
            vec![utxo(1, 100_000)],
            address.clone(),
            Network::Testnet,
            Amount::from_sat(50_000),
            params(),
        )
        .unwrap_err();
        assert_eq!(err, BuildError::AddressNetworkMismatch { network: Network::Testnet });
        let original = SenderBuilder::from_address(
            vec![utxo(1, 100_000)],
            address.clone(),
            Network::Bitcoin,
            Amount::from_sat(50_000),
            params(),
        )
        .unwrap()
        .build()
        .unwrap();
        assert_eq!(original.payee(), &address.assume_checked().script_pubkey());
    }
}
