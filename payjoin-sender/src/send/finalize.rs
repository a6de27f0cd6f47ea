//! Signing and finalization of a validated payjoin.
//!
//! The sender's inputs are signed through a [`Signer`], receiver inputs must already be final.
//! Before the transaction is released every input of a known script type is checked against
//! the output it spends and the fee rate is held to the declared maximum.

use bitcoin::hashes::Hash;
use bitcoin::script::Instruction;
use bitcoin::secp256k1::{Message, Secp256k1, VerifyOnly, XOnlyPublicKey};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::{
    ecdsa, psbt, taproot, FeeRate, LegacySighash, OutPoint, PublicKey, Script, ScriptBuf,
    SegwitV0Sighash, TapSighash, Transaction, TxOut, Txid, Witness,
};

use super::error::{BroadcastError, InternalFinalizationError, SigningError};
use super::validate::PayjoinProposal;
use super::OriginalProposal;
use crate::chain::Broadcaster;
use crate::fee;
use crate::proposal::Proposal;
use crate::ImplementationError;

/// Message digest an input signature commits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighash {
    /// P2PKH, `SIGHASH_ALL`
    Legacy(LegacySighash),
    /// P2WPKH, `SIGHASH_ALL`
    SegwitV0(SegwitV0Sighash),
    /// P2TR key path, `SIGHASH_DEFAULT`
    Taproot(TapSighash),
}

impl Sighash {
    pub fn message(&self) -> Message {
        match self {
            Sighash::Legacy(hash) => Message::from_digest(hash.to_byte_array()),
            Sighash::SegwitV0(hash) => Message::from_digest(hash.to_byte_array()),
            Sighash::Taproot(hash) => Message::from_digest(hash.to_byte_array()),
        }
    }
}

/// What the [`Signer`] is asked to sign for one sender input.
#[derive(Debug, Clone)]
pub struct SignRequest<'a> {
    pub input_index: usize,
    /// Script of the output being spent.
    pub script_pubkey: &'a Script,
    pub sighash: Sighash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSignature {
    Ecdsa { signature: ecdsa::Signature, public_key: PublicKey },
    Schnorr(taproot::Signature),
}

/// Key custody lives outside this crate. Implementors sign a digest for the given script, or
/// return `None` if they hold no key for it.
pub trait Signer {
    fn sign(&self, request: &SignRequest<'_>) -> Option<InputSignature>;
}

/// A fully signed transaction, ready for broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction(Transaction);

impl SignedTransaction {
    pub fn transaction(&self) -> &Transaction { &self.0 }

    pub fn into_transaction(self) -> Transaction { self.0 }

    pub fn txid(&self) -> Txid { self.0.compute_txid() }

    /// Consensus encoding.
    pub fn serialize(&self) -> Vec<u8> { bitcoin::consensus::encode::serialize(&self.0) }

    pub fn to_hex(&self) -> String { bitcoin::consensus::encode::serialize_hex(&self.0) }

    /// Hand the transaction to `broadcaster`.
    pub async fn broadcast<B>(&self, broadcaster: &B) -> Result<Txid, BroadcastError>
    where
        B: Broadcaster + ?Sized,
    {
        let txid = broadcaster.broadcast(&self.serialize()).await.map_err(BroadcastError::new)?;
        tracing::info!(%txid, "broadcast transaction");
        Ok(txid)
    }
}

/// Sign the sender's inputs of a validated payjoin and finalize it.
pub fn finalize<S>(payjoin: PayjoinProposal, signer: &S) -> Result<SignedTransaction, SigningError>
where
    S: Signer + ?Sized,
{
    let (proposal, sender_outpoints, max_fee_rate) = payjoin.into_parts();
    sign_and_extract(proposal, |outpoint| sender_outpoints.contains(outpoint), max_fee_rate, signer)
}

/// Sign and finalize the original proposal itself, for broadcasting without payjoin.
pub fn finalize_fallback<S>(
    original: &OriginalProposal,
    signer: &S,
) -> Result<SignedTransaction, SigningError>
where
    S: Signer + ?Sized,
{
    let max_fee_rate = original.fee_params().max_fee_rate;
    sign_and_extract(original.proposal().clone(), |_| true, max_fee_rate, signer)
}

fn sign_and_extract<S>(
    proposal: Proposal,
    is_sender_input: impl Fn(&OutPoint) -> bool,
    max_fee_rate: FeeRate,
    signer: &S,
) -> Result<SignedTransaction, SigningError>
where
    S: Signer + ?Sized,
{
    let fee = proposal.fee().to_unsigned().map_err(|_| InternalFinalizationError::Overspend)?;
    let prevouts = proposal.prevouts().to_vec();
    let mut psbt = proposal.into_psbt();
    let unsigned_tx = psbt.unsigned_tx.clone();
    let mut cache = SighashCache::new(&unsigned_tx);

    for (input_index, txin) in unsigned_tx.input.iter().enumerate() {
        let input = &mut psbt.inputs[input_index];
        if is_sender_input(&txin.previous_output) {
            let script_pubkey = &prevouts[input_index].script_pubkey;
            let sighash = sender_sighash(&mut cache, input_index, &prevouts)?;
            let request = SignRequest { input_index, script_pubkey, sighash };
            let signature = signer
                .sign(&request)
                .ok_or(SigningError::IncompleteSignatureSet { input_index })?;
            apply_signature(input, script_pubkey, signature);
            tracing::debug!(input_index, "signed sender input");
        } else if input.final_script_sig.is_none() && input.final_script_witness.is_none() {
            return Err(InternalFinalizationError::ReceiverInputNotFinalized { input_index }.into());
        }
    }

    let tx = psbt.extract_tx_unchecked_fee_rate();
    verify_inputs(&tx, &prevouts)?;
    if fee::exceeds_max_fee_rate(fee, tx.weight(), max_fee_rate) {
        return Err(InternalFinalizationError::FeeRateAboveMaximum {
            fee_rate: fee / tx.weight(),
            max: max_fee_rate,
        }
        .into());
    }
    tracing::info!(txid = %tx.compute_txid(), %fee, "finalized transaction");
    Ok(SignedTransaction(tx))
}

fn sender_sighash(
    cache: &mut SighashCache<&Transaction>,
    input_index: usize,
    prevouts: &[TxOut],
) -> Result<Sighash, SigningError> {
    let prevout = &prevouts[input_index];
    let script_pubkey = prevout.script_pubkey.as_script();
    if script_pubkey.is_p2wpkh() {
        cache
            .p2wpkh_signature_hash(input_index, script_pubkey, prevout.value, EcdsaSighashType::All)
            .map(Sighash::SegwitV0)
            .map_err(|e| sighash_error(input_index, e))
    } else if script_pubkey.is_p2pkh() {
        cache
            .legacy_signature_hash(input_index, script_pubkey, EcdsaSighashType::All.to_u32())
            .map(Sighash::Legacy)
            .map_err(|e| sighash_error(input_index, e))
    } else if script_pubkey.is_p2tr() {
        cache
            .taproot_key_spend_signature_hash(
                input_index,
                &Prevouts::All(prevouts),
                TapSighashType::Default,
            )
            .map(Sighash::Taproot)
            .map_err(|e| sighash_error(input_index, e))
    } else {
        tracing::warn!(input_index, %script_pubkey, "unsupported sender script type");
        Err(SigningError::IncompleteSignatureSet { input_index })
    }
}

fn sighash_error(input_index: usize, e: impl Into<ImplementationError>) -> SigningError {
    InternalFinalizationError::Sighash { input_index, source: e.into() }.into()
}

fn apply_signature(input: &mut psbt::Input, script_pubkey: &Script, signature: InputSignature) {
    input.final_script_sig = None;
    input.final_script_witness = None;
    match signature {
        InputSignature::Ecdsa { signature, public_key } =>
            if script_pubkey.is_p2pkh() {
                input.final_script_sig = Some(
                    ScriptBuf::builder()
                        .push_slice(signature.serialize())
                        .push_key(&public_key)
                        .into_script(),
                );
            } else {
                input.final_script_witness = Some(Witness::p2wpkh(&signature, &public_key.inner));
            },
        InputSignature::Schnorr(signature) =>
            input.final_script_witness = Some(Witness::p2tr_key_spend(&signature)),
    }
    input.partial_sigs.clear();
}

/// Check every input whose script type we understand against the output it spends.
fn verify_inputs(tx: &Transaction, prevouts: &[TxOut]) -> Result<(), SigningError> {
    let secp = Secp256k1::verification_only();
    let mut cache = SighashCache::new(tx);
    for (input_index, prevout) in prevouts.iter().enumerate() {
        let valid = verify_input(&secp, &mut cache, tx, input_index, prevouts)
            .map_err(|e| sighash_error(input_index, e))?;
        match valid {
            Some(true) => {}
            Some(false) =>
                return Err(InternalFinalizationError::InvalidSignature { input_index }.into()),
            None => tracing::debug!(
                input_index,
                script_pubkey = %prevout.script_pubkey,
                "skipping verification of unsupported script type"
            ),
        }
    }
    Ok(())
}

/// `None` when the script type is not one we can verify.
fn verify_input(
    secp: &Secp256k1<VerifyOnly>,
    cache: &mut SighashCache<&Transaction>,
    tx: &Transaction,
    input_index: usize,
    prevouts: &[TxOut],
) -> Result<Option<bool>, ImplementationError> {
    let txin = &tx.input[input_index];
    let prevout = &prevouts[input_index];
    let script_pubkey = prevout.script_pubkey.as_script();

    if script_pubkey.is_p2wpkh() {
        if !txin.script_sig.is_empty() {
            return Ok(Some(false));
        }
        let (Some(sig), Some(key), 2) =
            (txin.witness.nth(0), txin.witness.nth(1), txin.witness.len())
        else {
            return Ok(Some(false));
        };
        let (Ok(sig), Ok(key)) = (ecdsa::Signature::from_slice(sig), PublicKey::from_slice(key))
        else {
            return Ok(Some(false));
        };
        if key.wpubkey_hash().ok().map(|hash| ScriptBuf::new_p2wpkh(&hash)).as_deref()
            != Some(script_pubkey)
        {
            return Ok(Some(false));
        }
        let sighash = cache.p2wpkh_signature_hash(
            input_index,
            script_pubkey,
            prevout.value,
            sig.sighash_type,
        )?;
        Ok(Some(verify_ecdsa(secp, Sighash::SegwitV0(sighash), &sig, &key)))
    } else if script_pubkey.is_p2pkh() {
        if !txin.witness.is_empty() {
            return Ok(Some(false));
        }
        let pushes: Vec<&[u8]> = txin
            .script_sig
            .instructions()
            .map(|instruction| match instruction {
                Ok(Instruction::PushBytes(bytes)) => Some(bytes.as_bytes()),
                _ => None,
            })
            .collect::<Option<_>>()
            .unwrap_or_default();
        let &[sig, key] = pushes.as_slice() else { return Ok(Some(false)) };
        let (Ok(sig), Ok(key)) = (ecdsa::Signature::from_slice(sig), PublicKey::from_slice(key))
        else {
            return Ok(Some(false));
        };
        if ScriptBuf::new_p2pkh(&key.pubkey_hash()).as_script() != script_pubkey {
            return Ok(Some(false));
        }
        let sighash =
            cache.legacy_signature_hash(input_index, script_pubkey, sig.sighash_type.to_u32())?;
        Ok(Some(verify_ecdsa(secp, Sighash::Legacy(sighash), &sig, &key)))
    } else if script_pubkey.is_p2tr() {
        if !txin.script_sig.is_empty() {
            return Ok(Some(false));
        }
        let (Some(sig), 1) = (txin.witness.nth(0), txin.witness.len()) else {
            // script path spends are not checked
            return Ok(None);
        };
        let Ok(sig) = taproot::Signature::from_slice(sig) else { return Ok(Some(false)) };
        let Ok(output_key) = XOnlyPublicKey::from_slice(&script_pubkey.as_bytes()[2..34]) else {
            return Ok(Some(false));
        };
        let sighash = cache.taproot_key_spend_signature_hash(
            input_index,
            &Prevouts::All(prevouts),
            sig.sighash_type,
        )?;
        let message = Sighash::Taproot(sighash).message();
        Ok(Some(secp.verify_schnorr(&sig.signature, &message, &output_key).is_ok()))
    } else {
        Ok(None)
    }
}

fn verify_ecdsa(
    secp: &Secp256k1<VerifyOnly>,
    sighash: Sighash,
    sig: &ecdsa::Signature,
    key: &PublicKey,
) -> bool {
    secp.verify_ecdsa(&sighash.message(), &sig.signature, &key.inner).is_ok()
}
