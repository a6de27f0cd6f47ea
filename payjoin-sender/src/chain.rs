//! Interfaces to the blockchain data source and the broadcaster.

use async_trait::async_trait;
use bitcoin::consensus::encode::deserialize;
use bitcoin::{Address, Transaction, Txid};

use crate::proposal::Utxo;
use crate::ImplementationError;

/// Supplies the sender's unspent outputs. No caching or retries are expected.
#[async_trait]
pub trait UtxoSource: Send + Sync {
    async fn list_utxos(&self, address: &Address) -> Result<Vec<Utxo>, ImplementationError>;

    /// Consensus encoded transaction with the given id.
    async fn fetch_raw_transaction(&self, txid: Txid) -> Result<Vec<u8>, ImplementationError>;
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Submit consensus encoded transaction bytes to the network.
    async fn broadcast(&self, tx: &[u8]) -> Result<Txid, ImplementationError>;
}

/// List the UTXOs of `address` and attach the full transaction that created each of them.
pub async fn fetch_spendable_utxos<S>(
    source: &S,
    address: &Address,
) -> Result<Vec<Utxo>, ImplementationError>
where
    S: UtxoSource + ?Sized,
{
    let utxos = source.list_utxos(address).await?;
    tracing::debug!(%address, count = utxos.len(), "listed utxos");
    let mut spendable = Vec::with_capacity(utxos.len());
    for utxo in utxos {
        let raw = source.fetch_raw_transaction(utxo.outpoint.txid).await?;
        let tx: Transaction = deserialize(&raw)?;
        if tx.compute_txid() != utxo.outpoint.txid {
            let txid = utxo.outpoint.txid;
            return Err(format!("source returned the wrong transaction for {txid}").into());
        }
        spendable.push(utxo.with_previous_tx(tx));
    }
    Ok(spendable)
}
