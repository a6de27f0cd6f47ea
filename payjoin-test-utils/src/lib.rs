use std::net::SocketAddr;
use std::result::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::key::{Keypair, TapTweak};
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use bitcoin::sighash::TapSighashType;
use bitcoin::transaction::Version;
use bitcoin::{
    ecdsa, taproot, Amount, CompressedPublicKey, OutPoint, PublicKey, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use http::header::CONTENT_TYPE;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use once_cell::sync::OnceCell;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

pub use http::StatusCode;

pub type BoxSendSyncError = Box<dyn std::error::Error + Send + Sync>;

static INIT_TRACING: OnceCell<()> = OnceCell::new();

pub fn init_tracing() {
    INIT_TRACING.get_or_init(|| {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("failed to set global default subscriber");
    });
}

/// A private key derived from a single seed byte, with the scripts it can spend.
pub struct TestKey {
    secp: Secp256k1<All>,
    secret_key: SecretKey,
}

impl TestKey {
    pub fn new(seed: u8) -> Self {
        let secret_key = SecretKey::from_slice(&[seed; 32]).expect("seed must be non-zero");
        Self { secp: Secp256k1::new(), secret_key }
    }

    pub fn public_key(&self) -> PublicKey { PublicKey::new(self.secret_key.public_key(&self.secp)) }

    pub fn p2wpkh(&self) -> ScriptBuf {
        ScriptBuf::new_p2wpkh(&CompressedPublicKey(self.public_key().inner).wpubkey_hash())
    }

    pub fn p2pkh(&self) -> ScriptBuf { ScriptBuf::new_p2pkh(&self.public_key().pubkey_hash()) }

    pub fn p2tr(&self) -> ScriptBuf {
        let keypair = Keypair::from_secret_key(&self.secp, &self.secret_key);
        ScriptBuf::new_p2tr(&self.secp, keypair.x_only_public_key().0, None)
    }

    /// `SIGHASH_ALL` ECDSA signature over `message`.
    pub fn sign_ecdsa(&self, message: Message) -> ecdsa::Signature {
        ecdsa::Signature::sighash_all(self.secp.sign_ecdsa(&message, &self.secret_key))
    }

    /// Key path signature for the output returned by [`TestKey::p2tr`].
    pub fn sign_schnorr(&self, message: Message) -> taproot::Signature {
        let keypair = Keypair::from_secret_key(&self.secp, &self.secret_key)
            .tap_tweak(&self.secp, None)
            .to_keypair();
        taproot::Signature {
            signature: self.secp.sign_schnorr_no_aux_rand(&message, &keypair),
            sighash_type: TapSighashType::Default,
        }
    }

    /// Witness spending a P2WPKH output of this key.
    pub fn p2wpkh_witness(&self, message: Message) -> Witness {
        Witness::p2wpkh(&self.sign_ecdsa(message), &self.public_key().inner)
    }
}

/// A transaction paying `amount` to `script_pubkey` at output 0. `seed` makes the txid unique.
pub fn funding_tx(seed: u8, script_pubkey: ScriptBuf, amount: Amount) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint { txid: Txid::from_byte_array([seed; 32]), vout: 0 },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut { value: amount, script_pubkey }],
    }
}

/// What the mock receiver saw.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub path: String,
    pub query: Option<String>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

type Handler = dyn Fn(ReceivedRequest) -> (StatusCode, String) + Send + Sync;

/// A payjoin endpoint on an ephemeral localhost port, answering with a caller supplied handler.
pub struct MockReceiver {
    addr: SocketAddr,
    calls: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl MockReceiver {
    pub async fn start<F>(handler: F) -> Result<Self, BoxSendSyncError>
    where
        F: Fn(ReceivedRequest) -> (StatusCode, String) + Send + Sync + 'static,
    {
        Self::start_with_delay(handler, Duration::ZERO).await
    }

    /// Like [`MockReceiver::start`] but waits `delay` before every response.
    pub async fn start_with_delay<F>(handler: F, delay: Duration) -> Result<Self, BoxSendSyncError>
    where
        F: Fn(ReceivedRequest) -> (StatusCode, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let handler: Arc<Handler> = Arc::new(handler);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = handler.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let _ = http1::Builder::new()
                        .serve_connection(
                            TokioIo::new(stream),
                            service_fn(move |req| {
                                counter.fetch_add(1, Ordering::SeqCst);
                                respond(handler.clone(), delay, req)
                            }),
                        )
                        .await;
                });
            }
        });
        tracing::debug!(%addr, "mock receiver listening");
        Ok(Self { addr, calls, handle })
    }

    pub fn url(&self) -> Url { self.base_url().join("pj").expect("valid path") }

    /// Root of the server, for clients that build their own paths.
    pub fn base_url(&self) -> Url {
        Url::parse(&format!("http://{}/", self.addr)).expect("valid socket address url")
    }

    /// Number of requests received so far.
    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

impl Drop for MockReceiver {
    fn drop(&mut self) { self.handle.abort() }
}

async fn respond(
    handler: Arc<Handler>,
    delay: Duration,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_owned();
    let query = req.uri().query().map(str::to_owned);
    let content_type =
        req.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(str::to_owned);
    let body = req.into_body().collect().await?.to_bytes().to_vec();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let (status, body) = handler(ReceivedRequest { path, query, content_type, body });
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    Ok(response)
}
