#![cfg_attr(docsrs, feature(doc_cfg))]

//! # Payjoin sender
//!
//! The sending side of a [BIP 78 Payjoin](https://github.com/bitcoin/bips/blob/master/bip-0078.mediawiki):
//! build the original proposal, exchange it with the receiver, check the counter-proposal and
//! sign it.
//!
//! Data flows strictly forward through the [`send`] module:
//! [`SenderBuilder`](send::SenderBuilder) → [`extract_request`](send::OriginalProposal::extract_request)
//! / [`process_response`](send::OriginalProposal::process_response) → [`validate`](send::validate)
//! → [`finalize`](send::finalize). Nothing is signed unless validation passes.
//!
//! The library does no IO unless the `io` feature is enabled. UTXO lookup, broadcasting and key
//! custody are supplied by the caller through the traits in [`chain`] and [`send::Signer`].

pub extern crate bitcoin;

pub mod chain;
pub mod fee;
pub(crate) mod into_url;
#[cfg(feature = "io")]
#[cfg_attr(docsrs, doc(cfg(feature = "io")))]
pub mod io;
pub mod proposal;
pub mod psbt;
mod request;
pub mod send;
pub mod uri;

pub use fee::FeeParams;
pub use into_url::{Error as IntoUrlError, IntoUrl};
pub use proposal::{Proposal, ProposalError, Utxo};
pub use request::*;
pub use uri::{PjParseError, PjUri};
pub use url::{ParseError, Url};

/// Errors returned by caller supplied collaborators.
pub type ImplementationError = Box<dyn std::error::Error + Send + Sync>;

/// 4M block size limit with base64 encoding overhead => maximum reasonable size of content-length
/// 4_000_000 * 4 / 3 fits in u32
pub const MAX_CONTENT_LENGTH: usize = 4_000_000 * 4 / 3;
