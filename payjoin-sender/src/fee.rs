//! Linear fee model shared by the builder and the validator.
//!
//! Sizes are estimated per input and per output instead of from real witness weights, so the
//! same numbers come out regardless of script type.

use bitcoin::{Amount, FeeRate, SignedAmount, Weight};

use crate::proposal::Proposal;

/// Estimated serialized size of one input, in bytes.
pub const INPUT_SIZE: u64 = 148;
/// Estimated serialized size of one output, in bytes.
pub const OUTPUT_SIZE: u64 = 34;
/// Fixed transaction overhead, in bytes.
pub const TX_OVERHEAD: u64 = 10;
/// Outputs below this value are not created.
pub const DUST_THRESHOLD: Amount = Amount::from_sat(546);
/// Upper bound on the fee rate of any transaction this crate signs.
pub const DEFAULT_MAX_FEE_RATE: FeeRate = FeeRate::from_sat_per_kwu(5_000 * 250);

/// Fee parameters for one payjoin session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeParams {
    /// Sender's fee rate in satoshis per estimated byte.
    pub fee_rate_per_byte: u64,
    /// The most the receiver may raise the absolute fee by.
    pub max_additional_fee_contribution: Amount,
    pub dust_threshold: Amount,
    /// Signing refuses transactions paying more than this.
    pub max_fee_rate: FeeRate,
}

impl FeeParams {
    pub fn new(fee_rate_per_byte: u64, max_additional_fee_contribution: Amount) -> Self {
        Self {
            fee_rate_per_byte,
            max_additional_fee_contribution,
            dust_threshold: DUST_THRESHOLD,
            max_fee_rate: DEFAULT_MAX_FEE_RATE,
        }
    }

    pub fn with_max_fee_rate(mut self, max_fee_rate: FeeRate) -> Self {
        self.max_fee_rate = max_fee_rate;
        self
    }
}

/// `inputs * 148 + outputs * 34 + 10`
pub fn estimate_size(inputs: usize, outputs: usize) -> u64 {
    (inputs as u64)
        .saturating_mul(INPUT_SIZE)
        .saturating_add((outputs as u64).saturating_mul(OUTPUT_SIZE))
        .saturating_add(TX_OVERHEAD)
}

pub fn estimate_fee(inputs: usize, outputs: usize, fee_rate_per_byte: u64) -> Amount {
    Amount::from_sat(estimate_size(inputs, outputs).saturating_mul(fee_rate_per_byte))
}

/// Change in absolute fee from `original` to `proposal`. Negative when the proposal pays less.
pub fn fee_delta(original: &Proposal, proposal: &Proposal) -> SignedAmount {
    proposal.fee() - original.fee()
}

/// Whether the receiver's fee delta stays inside `[0, max]`.
pub fn is_within_budget(delta: SignedAmount, max: Amount) -> bool {
    match max.to_signed() {
        Ok(max) => delta >= SignedAmount::ZERO && delta <= max,
        Err(_) => delta >= SignedAmount::ZERO,
    }
}

pub fn is_dust(value: Amount, dust_threshold: Amount) -> bool { value <= dust_threshold }

pub fn exceeds_max_fee_rate(fee: Amount, weight: Weight, max_fee_rate: FeeRate) -> bool {
    if weight == Weight::ZERO {
        return false;
    }
    fee / weight > max_fee_rate
}
