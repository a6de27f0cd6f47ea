use anyhow::{anyhow, Context, Result};
use payjoin_sender::bitcoin::{Amount, Txid};
use payjoin_sender::chain::fetch_spendable_utxos;
use payjoin_sender::send::{
    finalize, finalize_fallback, validate, OriginalProposal, SenderBuilder, SignedTransaction,
};
use payjoin_sender::{io, PjUri};
use url::Url;

pub mod config;
pub mod esplora;
pub mod wallet;
use crate::app::config::Config;
use crate::app::esplora::EsploraClient;
use crate::app::wallet::KeySigner;

pub struct App {
    config: Config,
    esplora: EsploraClient,
    signer: KeySigner,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let esplora = EsploraClient::new(config.esplora_url()?);
        let signer = KeySigner::from_wif(&config.wif, config.network)?;
        Ok(Self { config, esplora, signer })
    }

    /// Pay the payjoin URI `bip21`, or with the original transaction if the payjoin fails and
    /// fallback is enabled. `amount` is used when the URI requests none.
    pub async fn send_payjoin(&self, bip21: &str, amount: Option<Amount>) -> Result<Txid> {
        let uri = PjUri::parse(bip21, self.config.network).context("Invalid payjoin URI")?;
        let amount = payment_amount(&uri, amount)?;
        let utxos = fetch_spendable_utxos(&self.esplora, self.signer.address())
            .await
            .map_err(|e| anyhow!(e))
            .context("Failed to fetch UTXOs")?;
        let original = SenderBuilder::new(
            utxos,
            uri.address().script_pubkey(),
            amount,
            self.config.fee_params()?,
        )
        .network(self.config.network)
        .build()
        .context("Failed to build original transaction")?;
        tracing::info!(
            inputs = original.proposal().unsigned_tx().input.len(),
            fee = %original.proposal().fee(),
            "built original proposal"
        );

        let signed = match self.try_payjoin(&original, uri.endpoint()).await {
            Ok(signed) => signed,
            Err(e) if self.config.fallback => {
                tracing::warn!("Payjoin failed, broadcasting the original transaction: {e:#}");
                finalize_fallback(&original, &self.signer)
                    .context("Failed to sign original transaction")?
            }
            Err(e) => return Err(e),
        };

        let txid = signed.broadcast(&self.esplora).await.context("Failed to broadcast")?;
        println!("Transaction sent. TXID: {txid}");
        Ok(txid)
    }

    async fn try_payjoin(
        &self,
        original: &OriginalProposal,
        endpoint: &Url,
    ) -> Result<SignedTransaction> {
        let counter = io::negotiate(original, endpoint.clone(), self.config.timeout())
            .await
            .context("Payjoin negotiation failed")?;
        let payjoin = validate(original, counter, original.fee_params())
            .context("Receiver's proposal rejected")?;
        finalize(payjoin, &self.signer).context("Failed to sign payjoin transaction")
    }
}

/// The URI's amount, or `requested` if the URI leaves it open. Both must agree when given.
fn payment_amount(uri: &PjUri, requested: Option<Amount>) -> Result<Amount> {
    match (uri.amount(), requested) {
        (Some(a), Some(b)) if a != b =>
            Err(anyhow!("--amount {b} conflicts with the amount {a} requested by the URI")),
        (Some(amount), _) | (None, Some(amount)) => Ok(amount),
        (None, None) => Err(anyhow!("please specify the amount in the URI or with --amount")),
    }
}
