//! Checks that a counter-proposal is a legitimate payjoin of the original proposal.
//!
//! The checks run in a fixed order and the first violation is reported:
//! preservation (transaction header, then outputs), receiver contribution, fee bound, sender
//! input integrity.

use bitcoin::{Amount, FeeRate, OutPoint, TxOut};

use super::error::ValidationError;
use super::OriginalProposal;
use crate::fee::{self, FeeParams};
use crate::proposal::Proposal;

type ValidationResult = Result<(), ValidationError>;

/// A counter-proposal that passed validation and may be signed.
#[derive(Debug, Clone)]
pub struct PayjoinProposal {
    proposal: Proposal,
    sender_outpoints: Vec<OutPoint>,
    max_fee_rate: FeeRate,
}

impl PayjoinProposal {
    pub fn proposal(&self) -> &Proposal { &self.proposal }

    /// Whether the input spending `outpoint` belongs to the sender.
    pub fn is_sender_input(&self, outpoint: &OutPoint) -> bool {
        self.sender_outpoints.contains(outpoint)
    }

    pub fn max_fee_rate(&self) -> FeeRate { self.max_fee_rate }

    pub(crate) fn into_parts(self) -> (Proposal, Vec<OutPoint>, FeeRate) {
        (self.proposal, self.sender_outpoints, self.max_fee_rate)
    }
}

/// Validate the receiver's `counter` proposal against the `original`.
///
/// Neither proposal is modified. On success the counter-proposal is returned in a form the
/// finalizer accepts.
pub fn validate(
    original: &OriginalProposal,
    counter: Proposal,
    fee_params: &FeeParams,
) -> Result<PayjoinProposal, ValidationError> {
    let verdict = check_version_and_lock_time(original.proposal(), &counter)
        .and_then(|()| check_outputs(original, &counter))
        .and_then(|()| check_receiver_contribution(original, &counter))
        .and_then(|()| check_fee(original.proposal(), &counter, fee_params))
        .and_then(|()| check_sender_inputs(original.proposal(), &counter));
    if let Err(e) = verdict {
        tracing::warn!(error = %e, "rejected counter-proposal");
        return Err(e);
    }
    tracing::info!(
        inputs = counter.unsigned_tx().input.len(),
        fee_delta = %fee::fee_delta(original.proposal(), &counter),
        "counter-proposal accepted"
    );
    Ok(PayjoinProposal {
        sender_outpoints: original.proposal().outpoints().collect(),
        max_fee_rate: fee_params.max_fee_rate,
        proposal: counter,
    })
}

fn check_version_and_lock_time(original: &Proposal, counter: &Proposal) -> ValidationResult {
    let (original, counter) = (original.unsigned_tx(), counter.unsigned_tx());
    if counter.version != original.version || counter.lock_time != original.lock_time {
        tracing::debug!(
            version = counter.version.0,
            lock_time = %counter.lock_time,
            "transaction header changed"
        );
        return Err(ValidationError::VersionOrLockTimeChanged);
    }
    Ok(())
}

/// Every original output survives unchanged, except the change output which may shrink or
/// disappear. Outputs the receiver added may not spend more than the receiver put in.
fn check_outputs(original: &OriginalProposal, counter: &Proposal) -> ValidationResult {
    let outputs = counter.outputs();
    let mut claimed = vec![false; outputs.len()];

    for (index, txout) in original.proposal().outputs().iter().enumerate() {
        if original.change_index() == Some(index) {
            continue;
        }
        if claim(outputs, &mut claimed, |o| o == txout).is_none() {
            tracing::debug!(index, "original output missing or altered");
            return Err(ValidationError::OutputsModified);
        }
    }

    if let Some(change) = original.change_output() {
        let found = claim(outputs, &mut claimed, |o| o.script_pubkey == change.script_pubkey);
        match found {
            Some(i) if outputs[i].value > change.value => {
                tracing::debug!(original = %change.value, proposed = %outputs[i].value, "change output increased");
                return Err(ValidationError::OutputsModified);
            }
            Some(_) => {}
            None => tracing::debug!("receiver removed the change output"),
        }
    }

    let receiver_outputs: Amount =
        outputs.iter().zip(&claimed).filter(|(_, c)| !**c).map(|(o, _)| o.value).sum();
    let receiver_inputs: Amount = counter
        .inputs()
        .filter(|(outpoint, _)| !original.proposal().contains_outpoint(outpoint))
        .map(|(_, txout)| txout.value)
        .sum();
    if receiver_outputs > receiver_inputs {
        tracing::debug!(%receiver_outputs, %receiver_inputs, "receiver outputs exceed receiver inputs");
        return Err(ValidationError::OutputsModified);
    }
    Ok(())
}

/// Index of the first unclaimed output matching `predicate`, which is then marked claimed.
fn claim(
    outputs: &[TxOut],
    claimed: &mut [bool],
    predicate: impl Fn(&TxOut) -> bool,
) -> Option<usize> {
    let index = outputs.iter().zip(claimed.iter()).position(|(o, c)| !c && predicate(o))?;
    claimed[index] = true;
    Some(index)
}

fn check_receiver_contribution(original: &OriginalProposal, counter: &Proposal) -> ValidationResult {
    if counter.outpoints().any(|outpoint| !original.proposal().contains_outpoint(&outpoint)) {
        Ok(())
    } else {
        Err(ValidationError::NoReceiverContribution)
    }
}

fn check_fee(original: &Proposal, counter: &Proposal, fee_params: &FeeParams) -> ValidationResult {
    let delta = fee::fee_delta(original, counter);
    let max = fee_params.max_additional_fee_contribution;
    tracing::debug!(%delta, %max, "fee contribution");
    if fee::is_within_budget(delta, max) {
        Ok(())
    } else {
        Err(ValidationError::ExcessiveFeeContribution { delta, max })
    }
}

/// Every sender input is still spent, spends exactly the output it spent originally and keeps
/// its sequence. The receiver must not hand back signature data for sender inputs.
fn check_sender_inputs(original: &Proposal, counter: &Proposal) -> ValidationResult {
    for (outpoint, txout) in original.inputs() {
        if counter.previous_txout(&outpoint) != Some(txout) {
            tracing::debug!(%outpoint, "sender input removed or altered");
            return Err(ValidationError::SenderInputTampered { outpoint });
        }
    }
    let counter_inputs = counter.unsigned_tx().input.iter().zip(&counter.psbt().inputs);
    for (txin, psbtin) in counter_inputs {
        let outpoint = txin.previous_output;
        let Some(original_txin) =
            original.unsigned_tx().input.iter().find(|i| i.previous_output == outpoint)
        else {
            continue;
        };
        if txin.sequence != original_txin.sequence {
            tracing::debug!(%outpoint, sequence = %txin.sequence, "sender input sequence changed");
            return Err(ValidationError::SenderInputTampered { outpoint });
        }
        if psbtin.final_script_sig.is_some()
            || psbtin.final_script_witness.is_some()
            || !psbtin.partial_sigs.is_empty()
        {
            tracing::debug!(%outpoint, "sender input carries signature data");
            return Err(ValidationError::SenderInputTampered { outpoint });
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::psbt::{self, Psbt};
    use bitcoin::transaction::Version;
    use bitcoin::{ScriptBuf, Sequence, SignedAmount, TxIn, Txid, WPubkeyHash, Witness};

    use super::*;
    use crate::proposal::Utxo;

    const SENDER: u8 = 1;
    const PAYEE: u8 = 2;
    const RECEIVER: u8 = 3;

    fn script(n: u8) -> ScriptBuf { ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([n; 20])) }

    fn outpoint(n: u8) -> OutPoint { OutPoint { txid: Txid::from_byte_array([n; 32]), vout: 0 } }

    fn params() -> FeeParams { FeeParams::new(10, Amount::from_sat(10_000)) }

    fn original(sat: u64) -> OriginalProposal {
        let utxo = Utxo::new(
            outpoint(100),
            TxOut { value: Amount::from_sat(sat), script_pubkey: script(SENDER) },
        );
        crate::send::build(vec![utxo], script(PAYEE), Amount::from_sat(50_000), params()).unwrap()
    }

    fn add_input(psbt: &mut Psbt, outpoint: OutPoint, sat: u64) {
        psbt.unsigned_tx.input.push(TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        });
        psbt.inputs.push(psbt::Input {
            witness_utxo: Some(TxOut { value: Amount::from_sat(sat), script_pubkey: script(RECEIVER) }),
            ..Default::default()
        });
    }

    fn add_output(psbt: &mut Psbt, script_pubkey: ScriptBuf, sat: u64) {
        psbt.unsigned_tx.output.push(TxOut { value: Amount::from_sat(sat), script_pubkey });
        psbt.outputs.push(psbt::Output::default());
    }

    /// The original with one receiver input and one receiver output added.
    fn payjoin(original: &OriginalProposal, input_sat: u64, output_sat: u64) -> Psbt {
        let mut psbt = original.psbt().clone();
        add_input(&mut psbt, outpoint(200), input_sat);
        add_output(&mut psbt, script(RECEIVER), output_sat);
        psbt
    }

    fn check(original: &OriginalProposal, psbt: Psbt) -> Result<PayjoinProposal, ValidationError> {
        validate(original, Proposal::from_psbt(psbt).unwrap(), &params())
    }

    #[test]
    fn receiver_contribution_passes() {
        let original = original(100_000);
        let payjoin = check(&original, payjoin(&original, 30_000, 28_000)).unwrap();
        assert!(payjoin.is_sender_input(&outpoint(100)));
        assert!(!payjoin.is_sender_input(&outpoint(200)));
        assert_eq!(
            fee::fee_delta(original.proposal(), payjoin.proposal()),
            SignedAmount::from_sat(2_000)
        );
    }

    #[test]
    fn unchanged_proposal_is_not_a_payjoin() {
        let original = original(100_000);
        assert_eq!(
            check(&original, original.psbt().clone()).unwrap_err(),
            ValidationError::NoReceiverContribution
        );
    }

    #[test]
    fn payment_output_is_immutable() {
        let original = original(100_000);

        let mut psbt = payjoin(&original, 30_000, 28_000);
        psbt.unsigned_tx.output[0].value = Amount::from_sat(49_999);
        assert_eq!(check(&original, psbt).unwrap_err(), ValidationError::OutputsModified);

        let mut psbt = payjoin(&original, 30_000, 28_000);
        psbt.unsigned_tx.output[0].script_pubkey = script(RECEIVER);
        assert_eq!(check(&original, psbt).unwrap_err(), ValidationError::OutputsModified);

        let mut psbt = payjoin(&original, 30_000, 28_000);
        psbt.unsigned_tx.output.remove(0);
        psbt.outputs.remove(0);
        assert_eq!(check(&original, psbt).unwrap_err(), ValidationError::OutputsModified);
    }

    #[test]
    fn change_may_shrink() {
        let original = original(100_000);
        let mut psbt = payjoin(&original, 30_000, 30_000);
        psbt.unsigned_tx.output[1].value = Amount::from_sat(37_740 - 5_000);
        assert!(check(&original, psbt).is_ok());
    }

    #[test]
    fn change_may_not_grow() {
        let original = original(100_000);
        let mut psbt = payjoin(&original, 30_000, 27_000);
        psbt.unsigned_tx.output[1].value = Amount::from_sat(37_740 + 1_000);
        assert_eq!(check(&original, psbt).unwrap_err(), ValidationError::OutputsModified);
    }

    #[test]
    fn change_may_be_removed() {
        let original = original(63_000);
        let change = original.change_output().unwrap().value;
        assert_eq!(change, Amount::from_sat(740));
        let mut psbt = payjoin(&original, 30_000, 30_000);
        psbt.unsigned_tx.output.remove(1);
        psbt.outputs.remove(1);
        assert!(check(&original, psbt).is_ok());
    }

    #[test]
    fn change_may_not_be_redirected_to_receiver() {
        let original = original(100_000);
        // the fee is unchanged but 5_000 of the sender's change ends up with the receiver
        let mut psbt = payjoin(&original, 30_000, 35_000);
        psbt.unsigned_tx.output[1].value = Amount::from_sat(37_740 - 5_000);
        assert_eq!(check(&original, psbt).unwrap_err(), ValidationError::OutputsModified);
    }

    #[test]
    fn fee_contribution_bound_is_inclusive() {
        let original = original(100_000);
        assert!(check(&original, payjoin(&original, 30_000, 20_000)).is_ok());
        assert_eq!(
            check(&original, payjoin(&original, 30_000, 19_999)).unwrap_err(),
            ValidationError::ExcessiveFeeContribution {
                delta: SignedAmount::from_sat(10_001),
                max: Amount::from_sat(10_000)
            }
        );
    }

    #[test]
    fn fee_decrease_is_rejected() {
        let original = original(100_000);
        let mut psbt = original.psbt().clone();
        psbt.unsigned_tx.output[1].value = Amount::from_sat(37_741);
        let counter = Proposal::from_psbt(psbt).unwrap();
        assert_eq!(
            check_fee(original.proposal(), &counter, &params()),
            Err(ValidationError::ExcessiveFeeContribution {
                delta: SignedAmount::from_sat(-1),
                max: Amount::from_sat(10_000)
            })
        );
    }

    #[test]
    fn substituted_sender_script_is_detected() {
        let original = original(100_000);
        let mut psbt = payjoin(&original, 30_000, 28_000);
        psbt.inputs[0].witness_utxo.as_mut().unwrap().script_pubkey = script(RECEIVER);
        assert_eq!(
            check(&original, psbt).unwrap_err(),
            ValidationError::SenderInputTampered { outpoint: outpoint(100) }
        );
    }

    #[test]
    fn dropped_sender_input_is_detected() {
        let original = original(100_000);
        let mut psbt = original.psbt().clone();
        psbt.unsigned_tx.input.clear();
        psbt.inputs.clear();
        add_input(&mut psbt, outpoint(200), 100_000);
        assert_eq!(
            check(&original, psbt).unwrap_err(),
            ValidationError::SenderInputTampered { outpoint: outpoint(100) }
        );
    }

    #[test]
    fn first_violation_in_check_order_is_reported() {
        let original = original(100_000);
        let mut psbt = original.psbt().clone();
        psbt.unsigned_tx.output[0].value = Amount::from_sat(1_000);
        psbt.inputs[0].witness_utxo.as_mut().unwrap().script_pubkey = script(RECEIVER);
        assert_eq!(check(&original, psbt).unwrap_err(), ValidationError::OutputsModified);

        let mut psbt = payjoin(&original, 30_000, 0);
        psbt.inputs[0].witness_utxo.as_mut().unwrap().script_pubkey = script(RECEIVER);
        assert!(matches!(
            check(&original, psbt).unwrap_err(),
            ValidationError::ExcessiveFeeContribution { .. }
        ));
    }

    #[test]
    fn version_and_lock_time_are_preserved() {
        let original = original(100_000);

        let mut psbt = payjoin(&original, 30_000, 28_000);
        psbt.unsigned_tx.lock_time = LockTime::from_consensus(499_999_999);
        assert_eq!(check(&original, psbt).unwrap_err(), ValidationError::VersionOrLockTimeChanged);

        let mut psbt = payjoin(&original, 30_000, 28_000);
        psbt.unsigned_tx.version = Version::ONE;
        assert_eq!(check(&original, psbt).unwrap_err(), ValidationError::VersionOrLockTimeChanged);
    }

    #[test]
    fn sender_sequence_is_preserved() {
        let original = original(100_000);
        let mut psbt = payjoin(&original, 30_000, 28_000);
        psbt.unsigned_tx.input[0].sequence = Sequence::MAX;
        assert_eq!(
            check(&original, psbt).unwrap_err(),
            ValidationError::SenderInputTampered { outpoint: outpoint(100) }
        );
    }

    #[test]
    fn sender_inputs_come_back_unsigned() {
        let original = original(100_000);

        let mut psbt = payjoin(&original, 30_000, 28_000);
        psbt.inputs[0].final_script_sig = Some(ScriptBuf::from_bytes(vec![0x51]));
        assert_eq!(
            check(&original, psbt).unwrap_err(),
            ValidationError::SenderInputTampered { outpoint: outpoint(100) }
        );

        let mut psbt = payjoin(&original, 30_000, 28_000);
        psbt.inputs[0].final_script_witness = Some(Witness::from_slice(&[[0x01]]));
        assert_eq!(
            check(&original, psbt).unwrap_err(),
            ValidationError::SenderInputTampered { outpoint: outpoint(100) }
        );
    }
}
