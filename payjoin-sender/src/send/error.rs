use std::fmt;
use std::time::Duration;

use bitcoin::{Amount, FeeRate, Network, OutPoint, SignedAmount};

use crate::proposal::ProposalError;
use crate::ImplementationError;

/// Error building the original proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    NoUtxosAvailable,
    InsufficientFunds { available: Amount, required: Amount },
    PaymentBelowDust { amount: Amount, dust_threshold: Amount },
    ZeroFeeRate,
    InvalidUtxo(ProposalError),
    AddressNetworkMismatch { network: Network },
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use BuildError::*;

        match self {
            NoUtxosAvailable => write!(f, "no UTXOs available to fund the payment"),
            InsufficientFunds { available, required } =>
                write!(f, "insufficient funds: {available} available, {required} required"),
            PaymentBelowDust { amount, dust_threshold } => write!(
                f,
                "payment amount {amount} must be greater than the dust threshold {dust_threshold}"
            ),
            ZeroFeeRate => write!(f, "fee rate must be greater than zero"),
            InvalidUtxo(e) => write!(f, "invalid UTXO: {e}"),
            AddressNetworkMismatch { network } =>
                write!(f, "payee address is not valid for network {network}"),
        }
    }
}

impl std::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BuildError::InvalidUtxo(e) => Some(e),
            _ => None,
        }
    }
}

/// Error returned when the request to the receiver could not be created.
#[derive(Debug)]
pub struct CreateRequestError(InternalCreateRequestError);

#[derive(Debug)]
pub(crate) enum InternalCreateRequestError {
    Url(crate::into_url::Error),
    Serialize(serde_json::Error),
}

impl From<InternalCreateRequestError> for CreateRequestError {
    fn from(value: InternalCreateRequestError) -> Self { CreateRequestError(value) }
}

impl fmt::Display for CreateRequestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use InternalCreateRequestError::*;

        match &self.0 {
            Url(e) => write!(f, "cannot parse endpoint url: {e}"),
            Serialize(e) => write!(f, "cannot serialize request body: {e}"),
        }
    }
}

impl std::error::Error for CreateRequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use InternalCreateRequestError::*;

        match &self.0 {
            Url(e) => Some(e),
            Serialize(e) => Some(e),
        }
    }
}

/// Error exchanging the original proposal with the receiver.
#[derive(Debug)]
pub enum NegotiationError {
    /// No response arrived within the caller supplied timeout.
    Timeout(Duration),
    MalformedResponse(MalformedResponse),
    EndpointUnreachable(ImplementationError),
}

impl From<MalformedResponse> for NegotiationError {
    fn from(value: MalformedResponse) -> Self { NegotiationError::MalformedResponse(value) }
}

impl From<InternalMalformedResponse> for NegotiationError {
    fn from(value: InternalMalformedResponse) -> Self {
        NegotiationError::MalformedResponse(value.into())
    }
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use NegotiationError::*;

        match self {
            Timeout(after) => write!(f, "receiver did not respond within {after:?}"),
            MalformedResponse(e) => write!(f, "malformed receiver response: {e}"),
            EndpointUnreachable(e) => write!(f, "receiver endpoint unreachable: {e}"),
        }
    }
}

impl std::error::Error for NegotiationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use NegotiationError::*;

        match self {
            Timeout(_) => None,
            MalformedResponse(e) => Some(e),
            EndpointUnreachable(e) => Some(e.as_ref()),
        }
    }
}

/// The receiver's response could not be turned into a proposal.
///
/// This is currently opaque type because we aren't sure which variants will stay.
/// You can only display it.
#[derive(Debug)]
pub struct MalformedResponse(InternalMalformedResponse);

#[derive(Debug)]
pub(crate) enum InternalMalformedResponse {
    Status(u16),
    ContentTooLarge,
    Json(serde_json::Error),
    Psbt(bitcoin::psbt::PsbtParseError),
    Proposal(ProposalError),
}

impl From<InternalMalformedResponse> for MalformedResponse {
    fn from(value: InternalMalformedResponse) -> Self { MalformedResponse(value) }
}

impl fmt::Display for MalformedResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use InternalMalformedResponse::*;

        match &self.0 {
            Status(status) => write!(f, "receiver responded with HTTP status {status}"),
            ContentTooLarge => write!(f, "response exceeds {} bytes", crate::MAX_CONTENT_LENGTH),
            Json(e) => write!(f, "couldn't decode response envelope: {e}"),
            Psbt(e) => write!(f, "couldn't decode PSBT: {e}"),
            Proposal(e) => write!(f, "counter-proposal is structurally invalid: {e}"),
        }
    }
}

impl std::error::Error for MalformedResponse {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use InternalMalformedResponse::*;

        match &self.0 {
            Status(_) | ContentTooLarge => None,
            Json(e) => Some(e),
            Psbt(e) => Some(e),
            Proposal(e) => Some(e),
        }
    }
}

/// The counter-proposal is not a legitimate payjoin of the original proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The transaction version or lock time differs from the original.
    VersionOrLockTimeChanged,
    /// An original output is missing or altered, or value was redirected to the receiver.
    OutputsModified,
    /// The receiver added no input of their own.
    NoReceiverContribution,
    /// The absolute fee decreased, or increased by more than the agreed maximum.
    ExcessiveFeeContribution { delta: SignedAmount, max: Amount },
    /// A sender input is missing, spends a different output than originally, has a different
    /// sequence, or arrives carrying signature data.
    SenderInputTampered { outpoint: OutPoint },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ValidationError::*;

        match self {
            VersionOrLockTimeChanged =>
                write!(f, "counter-proposal changed the transaction version or lock time"),
            OutputsModified => write!(f, "counter-proposal modified the sender's outputs"),
            NoReceiverContribution => write!(f, "counter-proposal adds no receiver input"),
            ExcessiveFeeContribution { delta, max } =>
                write!(f, "fee changed by {delta}, allowed range is 0 to {max}"),
            SenderInputTampered { outpoint } =>
                write!(f, "sender input {outpoint} was removed or altered"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Error signing or finalizing the payjoin transaction.
#[derive(Debug)]
pub enum SigningError {
    /// The signer could not produce a signature for this sender input.
    IncompleteSignatureSet { input_index: usize },
    FinalizationFailed(FinalizationError),
}

impl From<InternalFinalizationError> for SigningError {
    fn from(value: InternalFinalizationError) -> Self {
        SigningError::FinalizationFailed(FinalizationError(value))
    }
}

impl fmt::Display for SigningError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SigningError::IncompleteSignatureSet { input_index } =>
                write!(f, "no signature available for sender input #{input_index}"),
            SigningError::FinalizationFailed(e) => write!(f, "finalization failed: {e}"),
        }
    }
}

impl std::error::Error for SigningError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SigningError::IncompleteSignatureSet { .. } => None,
            SigningError::FinalizationFailed(e) => Some(e),
        }
    }
}

/// The signed transaction failed local validation.
#[derive(Debug)]
pub struct FinalizationError(pub(crate) InternalFinalizationError);

#[derive(Debug)]
pub(crate) enum InternalFinalizationError {
    ReceiverInputNotFinalized { input_index: usize },
    Sighash { input_index: usize, source: ImplementationError },
    InvalidSignature { input_index: usize },
    FeeRateAboveMaximum { fee_rate: FeeRate, max: FeeRate },
    Overspend,
}

impl fmt::Display for FinalizationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use InternalFinalizationError::*;

        match &self.0 {
            ReceiverInputNotFinalized { input_index } =>
                write!(f, "receiver input #{input_index} is not finalized"),
            Sighash { input_index, source } =>
                write!(f, "cannot compute sighash for input #{input_index}: {source}"),
            InvalidSignature { input_index } =>
                write!(f, "input #{input_index} does not satisfy the script it spends"),
            FeeRateAboveMaximum { fee_rate, max } => write!(
                f,
                "fee rate {} sat/vB exceeds the maximum of {} sat/vB",
                fee_rate.to_sat_per_vb_ceil(),
                max.to_sat_per_vb_ceil()
            ),
            Overspend => write!(f, "outputs exceed inputs"),
        }
    }
}

impl std::error::Error for FinalizationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.0 {
            InternalFinalizationError::Sighash { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// The broadcaster rejected the transaction. The collaborator's error is kept as is.
#[derive(Debug)]
pub struct BroadcastError(ImplementationError);

impl BroadcastError {
    pub fn new(source: impl Into<ImplementationError>) -> Self { BroadcastError(source.into()) }

    pub fn into_inner(self) -> ImplementationError { self.0 }
}

impl fmt::Display for BroadcastError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "broadcast failed: {}", self.0)
    }
}

impl std::error::Error for BroadcastError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> { Some(self.0.as_ref()) }
}
