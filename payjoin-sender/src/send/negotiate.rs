//! Transport encoding of the exchange with the receiver.
//!
//! Both directions carry a base64 PSBT wrapped in a JSON envelope. Nothing here judges whether
//! the counter-proposal is a legitimate payjoin; that is left to [`super::validate`].

use std::str::FromStr;

use bitcoin::psbt::Psbt;
use serde::{Deserialize, Serialize};
use url::Url;

use super::error::{
    CreateRequestError, InternalCreateRequestError, InternalMalformedResponse, NegotiationError,
};
use super::OriginalProposal;
use crate::into_url::IntoUrl;
use crate::proposal::Proposal;
use crate::request::Request;
use crate::MAX_CONTENT_LENGTH;

#[derive(Debug, Serialize, Deserialize)]
struct PsbtEnvelope {
    psbt: String,
}

/// Error replies a BIP78 receiver may send instead of a proposal.
const WELL_KNOWN_ERROR_CODES: [&str; 4] =
    ["unavailable", "not-enough-money", "version-unsupported", "original-psbt-rejected"];

impl OriginalProposal {
    /// Prepare the HTTP request carrying this proposal to `endpoint`.
    ///
    /// The request must be sent at most once. Receivers are not required to answer a
    /// resubmission consistently.
    pub fn extract_request(&self, endpoint: impl IntoUrl) -> Result<Request, CreateRequestError> {
        let endpoint = endpoint.into_url().map_err(InternalCreateRequestError::Url)?;
        let url = serialize_url(
            endpoint,
            self.change_index,
            self.fee_params.max_additional_fee_contribution,
        );
        let body = serde_json::to_vec(&PsbtEnvelope { psbt: self.proposal.to_string() })
            .map_err(InternalCreateRequestError::Serialize)?;
        tracing::debug!(%url, "extracted payjoin request");
        Ok(Request::new_json(&url, body))
    }

    /// Decode the receiver's reply into a counter-proposal.
    ///
    /// Only structural checks are performed. The result must go through
    /// [`validate`](super::validate) before anything is signed.
    pub fn process_response(&self, status: u16, body: &[u8]) -> Result<Proposal, NegotiationError> {
        if body.len() > MAX_CONTENT_LENGTH {
            return Err(InternalMalformedResponse::ContentTooLarge.into());
        }
        if !(200..300).contains(&status) {
            log_well_known_error(body);
            return Err(InternalMalformedResponse::Status(status).into());
        }
        let envelope: PsbtEnvelope =
            serde_json::from_slice(body).map_err(InternalMalformedResponse::Json)?;
        let psbt = Psbt::from_str(&envelope.psbt).map_err(InternalMalformedResponse::Psbt)?;
        let proposal = Proposal::from_psbt(psbt).map_err(InternalMalformedResponse::Proposal)?;
        tracing::debug!(
            inputs = proposal.unsigned_tx().input.len(),
            outputs = proposal.outputs().len(),
            "decoded counter-proposal"
        );
        Ok(proposal)
    }
}

fn serialize_url(
    endpoint: Url,
    change_index: Option<usize>,
    max_additional_fee_contribution: bitcoin::Amount,
) -> Url {
    let mut url = endpoint;
    url.query_pairs_mut()
        .append_pair("v", "1")
        .append_pair("disableoutputsubstitution", "true");
    if let Some(vout) = change_index {
        url.query_pairs_mut()
            .append_pair("additionalfeeoutputindex", &vout.to_string())
            .append_pair(
                "maxadditionalfeecontribution",
                &max_additional_fee_contribution.to_sat().to_string(),
            );
    }
    url
}

// Receiver supplied text is only ever logged, never surfaced.
fn log_well_known_error(body: &[u8]) {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else { return };
    match value.get("errorCode").and_then(|code| code.as_str()) {
        Some(code) if WELL_KNOWN_ERROR_CODES.contains(&code) =>
            tracing::debug!(code, "receiver returned well-known error"),
        Some(_) => tracing::debug!("receiver returned unrecognized error code"),
        None => {}
    }
}

#[cfg(test)]
mod test {
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{
        psbt, Amount, OutPoint, PubkeyHash, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
        WPubkeyHash,
    };

    use super::*;
    use crate::fee::FeeParams;
    use crate::proposal::{ProposalError, Utxo};
    use crate::send::error::MalformedResponse;
    use crate::send::{validate, ValidationError};

    fn original(sat: u64) -> OriginalProposal {
        let script = ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([1; 20]));
        let utxo = Utxo::new(
            OutPoint { txid: Txid::from_byte_array([7; 32]), vout: 0 },
            TxOut { value: Amount::from_sat(sat), script_pubkey: script.clone() },
        );
        crate::send::build(
            vec![utxo],
            ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([2; 20])),
            Amount::from_sat(50_000),
            FeeParams::new(10, Amount::from_sat(10_000)),
        )
        .expect("valid original")
    }

    fn malformed(result: Result<Proposal, NegotiationError>) -> MalformedResponse {
        match result {
            Err(NegotiationError::MalformedResponse(e)) => e,
            other => panic!("expected malformed response, got {other:?}"),
        }
    }

    #[test]
    fn request_carries_json_envelope_and_parameters() {
        let original = original(100_000);
        let request = original.extract_request("https://example.com/pj").unwrap();
        assert_eq!(request.content_type, "application/json");
        assert_eq!(
            request.url.as_str(),
            "https://example.com/pj?v=1&disableoutputsubstitution=true&additionalfeeoutputindex=1&maxadditionalfeecontribution=10000"
        );
        let envelope: PsbtEnvelope = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(envelope.psbt, original.proposal().to_string());
    }

    #[test]
    fn request_without_change_omits_fee_parameters() {
        let original = original(62_806);
        assert_eq!(original.change_index(), None);
        let request = original.extract_request("http://localhost:3000").unwrap();
        assert_eq!(request.url.query(), Some("v=1&disableoutputsubstitution=true"));
    }

    #[test]
    fn bad_endpoint_scheme() {
        assert!(original(100_000).extract_request("file:///etc/hosts").is_err());
    }

    #[test]
    fn response_round_trip() {
        let original = original(100_000);
        let body = serde_json::json!({ "psbt": original.proposal().to_string() }).to_string();
        let proposal = original.process_response(200, body.as_bytes()).unwrap();
        assert_eq!(&proposal, original.proposal());
    }

    #[test]
    fn non_success_status_is_malformed() {
        let original = original(100_000);
        let body = serde_json::json!({
            "errorCode": "version-unsupported",
            "message": "This version of payjoin is not supported."
        })
        .to_string();
        let err = malformed(original.process_response(400, body.as_bytes()));
        assert_eq!(err.to_string(), "receiver responded with HTTP status 400");
        malformed(original.process_response(503, b"<html>busy</html>"));
    }

    #[test]
    fn garbage_is_malformed() {
        let original = original(100_000);
        malformed(original.process_response(200, b"not json"));
        malformed(original.process_response(200, br#"{"psbt": "bm90IGEgcHNidA=="}"#));
        malformed(original.process_response(200, br#"{"other": "field"}"#));
    }

    #[test]
    fn oversized_response_is_rejected_before_parsing() {
        let original = original(100_000);
        let body = vec![b' '; MAX_CONTENT_LENGTH + 1];
        let err = malformed(original.process_response(200, &body));
        assert!(err.to_string().starts_with("response exceeds"));
    }

    /// A receiver P2PKH input worth 30_000 sat, a 35_000 sat receiver output, and the sender's
    /// change cut by 5_000 sat.
    fn legacy_receiver_payjoin(
        original: &OriginalProposal,
        describe: impl FnOnce(Transaction) -> psbt::Input,
    ) -> Vec<u8> {
        let receiver = ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([3; 20]));
        let funding = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut { value: Amount::from_sat(30_000), script_pubkey: receiver.clone() }],
        };
        let mut psbt = original.psbt().clone();
        psbt.unsigned_tx.input.push(TxIn {
            previous_output: OutPoint { txid: funding.compute_txid(), vout: 0 },
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            ..Default::default()
        });
        psbt.inputs.push(describe(funding));
        psbt.unsigned_tx.output[1].value -= Amount::from_sat(5_000);
        psbt.unsigned_tx
            .output
            .push(TxOut { value: Amount::from_sat(35_000), script_pubkey: receiver });
        psbt.outputs.push(psbt::Output::default());
        serde_json::json!({ "psbt": psbt.to_string() }).to_string().into_bytes()
    }

    fn inflated(funding: &Transaction) -> TxOut {
        TxOut { value: Amount::from_sat(35_000), ..funding.output[0].clone() }
    }

    #[test]
    fn legacy_input_amount_must_come_from_previous_transaction() {
        let original = original(100_000);

        let body = legacy_receiver_payjoin(&original, |funding| psbt::Input {
            witness_utxo: Some(inflated(&funding)),
            ..Default::default()
        });
        let err = malformed(original.process_response(200, &body));
        assert!(matches!(
            std::error::Error::source(&err).and_then(|e| e.downcast_ref::<ProposalError>()),
            Some(ProposalError::InvalidInput(e)) if e.index() == 1
        ));

        let body = legacy_receiver_payjoin(&original, |funding| psbt::Input {
            witness_utxo: Some(inflated(&funding)),
            non_witness_utxo: Some(funding),
            ..Default::default()
        });
        malformed(original.process_response(200, &body));

        // the true amount leaves the receiver output uncovered
        let body = legacy_receiver_payjoin(&original, |funding| psbt::Input {
            non_witness_utxo: Some(funding),
            ..Default::default()
        });
        let counter = original.process_response(200, &body).unwrap();
        assert_eq!(
            validate(&original, counter, original.fee_params()).unwrap_err(),
            ValidationError::OutputsModified
        );
    }
}
