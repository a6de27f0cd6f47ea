use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use payjoin_sender::bitcoin::hex::{DisplayHex, FromHex};
use payjoin_sender::bitcoin::{Address, Amount, OutPoint, TxOut, Txid};
use payjoin_sender::chain::{Broadcaster, UtxoSource};
use payjoin_sender::{ImplementationError, Utxo};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use url::Url;

/// UTXO lookup and broadcast through an Esplora REST API.
#[derive(Debug, Clone)]
pub struct EsploraClient {
    http: Client,
    base: Url,
}

#[derive(Debug)]
pub enum EsploraError {
    /// HTTP 429
    RateLimited,
    Status(u16),
}

impl fmt::Display for EsploraError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EsploraError::RateLimited => write!(f, "esplora rate limit reached, try again later"),
            EsploraError::Status(status) => write!(f, "esplora returned HTTP {status}"),
        }
    }
}

impl std::error::Error for EsploraError {}

#[derive(Debug, Deserialize)]
struct EsploraUtxo {
    txid: Txid,
    vout: u32,
    value: u64,
}

impl EsploraClient {
    pub fn new(mut base: Url) -> Self {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self { http: Client::new(), base }
    }

    async fn get(&self, path: &str) -> Result<Response, ImplementationError> {
        let url = self.base.join(path)?;
        tracing::debug!(%url, "esplora request");
        check_status(self.http.get(url).send().await?)
    }
}

fn check_status(response: Response) -> Result<Response, ImplementationError> {
    match response.status() {
        StatusCode::TOO_MANY_REQUESTS => Err(EsploraError::RateLimited.into()),
        status if !status.is_success() => Err(EsploraError::Status(status.as_u16()).into()),
        _ => Ok(response),
    }
}

#[async_trait]
impl UtxoSource for EsploraClient {
    async fn list_utxos(&self, address: &Address) -> Result<Vec<Utxo>, ImplementationError> {
        let entries: Vec<EsploraUtxo> =
            self.get(&format!("address/{address}/utxo")).await?.json().await?;
        let script_pubkey = address.script_pubkey();
        Ok(entries
            .into_iter()
            .map(|e| {
                let txout =
                    TxOut { value: Amount::from_sat(e.value), script_pubkey: script_pubkey.clone() };
                Utxo::new(OutPoint { txid: e.txid, vout: e.vout }, txout)
            })
            .collect())
    }

    async fn fetch_raw_transaction(&self, txid: Txid) -> Result<Vec<u8>, ImplementationError> {
        let hex = self.get(&format!("tx/{txid}/hex")).await?.text().await?;
        Ok(Vec::<u8>::from_hex(hex.trim())?)
    }
}

#[async_trait]
impl Broadcaster for EsploraClient {
    async fn broadcast(&self, tx: &[u8]) -> Result<Txid, ImplementationError> {
        let url = self.base.join("tx")?;
        let response =
            check_status(self.http.post(url).body(tx.to_lower_hex_string()).send().await?)?;
        let txid = Txid::from_str(response.text().await?.trim())?;
        tracing::info!(%txid, "broadcast accepted");
        Ok(txid)
    }
}
