//! BIP21 payment URIs with a payjoin endpoint
//!
//! `bitcoin:<address>?amount=<btc>&pj=<endpoint>` as handed out by a receiver. The address is
//! checked against the sender's network while parsing.

use std::fmt;

use bitcoin::address::NetworkUnchecked;
use bitcoin::amount::ParseAmountError;
use bitcoin::{Address, Amount, Denomination, Network};
use url::{form_urlencoded, Url};

use crate::into_url::private::Sealed;

/// A payment request that supports payjoin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PjUri {
    address: Address,
    amount: Option<Amount>,
    endpoint: Url,
}

impl PjUri {
    /// Parse `uri` and require its address to belong to `network`.
    pub fn parse(uri: &str, network: Network) -> Result<Self, PjParseError> {
        let url = Url::parse(uri).map_err(InternalPjParseError::Url)?;
        if url.scheme() != "bitcoin" {
            return Err(InternalPjParseError::NotBitcoinUri.into());
        }
        let address = url
            .path()
            .parse::<Address<NetworkUnchecked>>()
            .map_err(InternalPjParseError::Address)?
            .require_network(network)
            .map_err(|_| InternalPjParseError::WrongNetwork(network))?;

        let mut amount = None;
        let mut endpoint = None;
        let mut pjos = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "amount" => {
                    let parsed = Amount::from_str_in(&value, Denomination::Bitcoin)
                        .map_err(InternalPjParseError::Amount)?;
                    set_once(&mut amount, parsed, "amount")?;
                }
                "pj" => set_once(&mut endpoint, value.into_owned(), "pj")?,
                "pjos" => {
                    let disabled = match value.as_ref() {
                        "0" => false,
                        "1" => true,
                        _ => return Err(InternalPjParseError::BadPjOs.into()),
                    };
                    set_once(&mut pjos, disabled, "pjos")?;
                }
                other if other.starts_with("req-") => {
                    let param = other.to_owned();
                    return Err(InternalPjParseError::UnknownRequiredParam(param).into());
                }
                _ => {}
            }
        }

        let endpoint = endpoint.ok_or(InternalPjParseError::MissingEndpoint)?;
        let endpoint = secure_endpoint(&endpoint)?;
        Ok(PjUri { address, amount, endpoint })
    }

    pub fn address(&self) -> &Address { &self.address }

    /// Requested amount, if the receiver asked for one.
    pub fn amount(&self) -> Option<Amount> { self.amount }

    pub fn endpoint(&self) -> &Url { &self.endpoint }
}

fn set_once<T>(slot: &mut Option<T>, value: T, param: &'static str) -> Result<(), PjParseError> {
    if slot.replace(value).is_some() {
        return Err(InternalPjParseError::DuplicateParams(param).into());
    }
    Ok(())
}

/// https, or plain http to an onion service.
fn secure_endpoint(endpoint: &str) -> Result<Url, PjParseError> {
    let url = endpoint.into_url().map_err(InternalPjParseError::BadEndpoint)?;
    let onion = url.domain().is_some_and(|domain| domain.ends_with(".onion"));
    if url.scheme() == "https" || onion {
        Ok(url)
    } else {
        Err(InternalPjParseError::UnsecureEndpoint.into())
    }
}

impl fmt::Display for PjUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut query = form_urlencoded::Serializer::new(String::new());
        if let Some(amount) = self.amount {
            query.append_pair("amount", &amount.to_string_in(Denomination::Bitcoin));
        }
        query.append_pair("pj", self.endpoint.as_str());
        write!(f, "bitcoin:{}?{}", self.address, query.finish())
    }
}

/// The URI is not a usable payjoin payment request.
#[derive(Debug)]
pub struct PjParseError(InternalPjParseError);

#[derive(Debug)]
pub(crate) enum InternalPjParseError {
    Url(url::ParseError),
    NotBitcoinUri,
    Address(bitcoin::address::ParseError),
    WrongNetwork(Network),
    Amount(ParseAmountError),
    DuplicateParams(&'static str),
    BadPjOs,
    UnknownRequiredParam(String),
    MissingEndpoint,
    BadEndpoint(crate::into_url::Error),
    UnsecureEndpoint,
}

impl From<InternalPjParseError> for PjParseError {
    fn from(value: InternalPjParseError) -> Self { PjParseError(value) }
}

impl fmt::Display for PjParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use InternalPjParseError::*;

        match &self.0 {
            Url(e) => write!(f, "not a URI: {e}"),
            NotBitcoinUri => write!(f, "not a bitcoin: URI"),
            Address(e) => write!(f, "invalid address: {e}"),
            WrongNetwork(network) => write!(f, "address is not valid for network {network}"),
            Amount(e) => write!(f, "invalid amount: {e}"),
            DuplicateParams(param) => write!(f, "multiple instances of parameter '{param}'"),
            BadPjOs => write!(f, "bad pjos parameter"),
            UnknownRequiredParam(param) => write!(f, "unsupported required parameter '{param}'"),
            MissingEndpoint => write!(f, "missing payjoin endpoint"),
            BadEndpoint(e) => write!(f, "endpoint is not valid: {e}"),
            UnsecureEndpoint => write!(f, "endpoint scheme is not secure (https or onion)"),
        }
    }
}

impl std::error::Error for PjParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use InternalPjParseError::*;

        match &self.0 {
            Url(e) => Some(e),
            Address(e) => Some(e),
            Amount(e) => Some(e),
            BadEndpoint(e) => Some(e),
            NotBitcoinUri | WrongNetwork(_) | DuplicateParams(_) | BadPjOs
            | UnknownRequiredParam(_) | MissingEndpoint | UnsecureEndpoint => None,
        }
    }
}
