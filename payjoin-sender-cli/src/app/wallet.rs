use anyhow::{anyhow, Context, Result};
use payjoin_sender::bitcoin::key::{Keypair, TapTweak, TweakedKeypair};
use payjoin_sender::bitcoin::secp256k1::{All, Secp256k1};
use payjoin_sender::bitcoin::sighash::TapSighashType;
use payjoin_sender::bitcoin::{
    ecdsa, taproot, Address, CompressedPublicKey, Network, NetworkKind, PrivateKey, PublicKey,
    Script, ScriptBuf,
};
use payjoin_sender::send::{InputSignature, Sighash, SignRequest, Signer};

/// A single key loaded from WIF, able to spend its P2WPKH, P2PKH and P2TR key path outputs.
pub struct KeySigner {
    secp: Secp256k1<All>,
    key: PrivateKey,
    public_key: PublicKey,
    tweaked: TweakedKeypair,
    address: Address,
    p2pkh: ScriptBuf,
    p2tr: ScriptBuf,
}

impl KeySigner {
    pub fn from_wif(wif: &str, network: Network) -> Result<Self> {
        let key = PrivateKey::from_wif(wif).context("Invalid WIF private key")?;
        if key.network != NetworkKind::from(network) {
            return Err(anyhow!("WIF private key does not belong to {network}"));
        }
        let secp = Secp256k1::new();
        let compressed = CompressedPublicKey::from_private_key(&secp, &key)
            .map_err(|_| anyhow!("Uncompressed WIF keys are not supported"))?;
        let keypair = Keypair::from_secret_key(&secp, &key.inner);
        let (internal_key, _) = keypair.x_only_public_key();
        let tweaked = keypair.tap_tweak(&secp, None);

        Ok(Self {
            public_key: PublicKey::from(compressed),
            address: Address::p2wpkh(&compressed, network),
            p2pkh: ScriptBuf::new_p2pkh(&compressed.pubkey_hash()),
            p2tr: ScriptBuf::new_p2tr(&secp, internal_key, None),
            tweaked,
            key,
            secp,
        })
    }

    /// The P2WPKH address whose UTXOs are spent.
    pub fn address(&self) -> &Address { &self.address }

    fn owns(&self, script_pubkey: &Script) -> bool {
        script_pubkey == self.address.script_pubkey().as_script()
            || script_pubkey == self.p2pkh.as_script()
            || script_pubkey == self.p2tr.as_script()
    }
}

impl Signer for KeySigner {
    fn sign(&self, request: &SignRequest<'_>) -> Option<InputSignature> {
        if !self.owns(request.script_pubkey) {
            tracing::debug!(input = request.input_index, "no key for input script");
            return None;
        }
        let message = request.sighash.message();
        match request.sighash {
            Sighash::Legacy(_) | Sighash::SegwitV0(_) => Some(InputSignature::Ecdsa {
                signature: ecdsa::Signature::sighash_all(
                    self.secp.sign_ecdsa(&message, &self.key.inner),
                ),
                public_key: self.public_key,
            }),
            Sighash::Taproot(_) => Some(InputSignature::Schnorr(taproot::Signature {
                signature: self
                    .secp
                    .sign_schnorr_no_aux_rand(&message, &self.tweaked.to_keypair()),
                sighash_type: TapSighashType::Default,
            })),
        }
    }
}

#[cfg(test)]
mod test {
    use payjoin_sender::bitcoin::secp256k1::SecretKey;
    use payjoin_sender::bitcoin::Amount;
    use payjoin_sender::send::{finalize_fallback, SenderBuilder, SigningError};
    use payjoin_sender::{FeeParams, Utxo};
    use payjoin_test_utils::{funding_tx, TestKey};

    use super::*;

    fn signer() -> KeySigner {
        let secret = SecretKey::from_slice(&[9; 32]).unwrap();
        KeySigner::from_wif(&PrivateKey::new(secret, Network::Regtest).to_wif(), Network::Regtest)
            .unwrap()
    }

    fn spend(script: ScriptBuf, signer: &KeySigner) -> Result<(), SigningError> {
        let funding = funding_tx(9, script, Amount::from_sat(100_000));
        let original = SenderBuilder::new(
            vec![Utxo::from_transaction(funding, 0).unwrap()],
            TestKey::new(2).p2wpkh(),
            Amount::from_sat(50_000),
            FeeParams::new(10, Amount::from_sat(1_000)),
        )
        .build()
        .unwrap();
        finalize_fallback(&original, signer).map(|_| ())
    }

    #[test]
    fn signs_every_supported_script() {
        let signer = signer();
        spend(signer.address().script_pubkey(), &signer).unwrap();
        spend(signer.p2pkh.clone(), &signer).unwrap();
        spend(signer.p2tr.clone(), &signer).unwrap();
    }

    #[test]
    fn refuses_foreign_scripts() {
        let signer = signer();
        assert!(matches!(
            spend(TestKey::new(4).p2wpkh(), &signer),
            Err(SigningError::IncompleteSignatureSet { input_index: 0 })
        ));
    }

    #[test]
    fn rejects_wif_from_other_network() {
        let secret = SecretKey::from_slice(&[9; 32]).unwrap();
        let wif = PrivateKey::new(secret, Network::Bitcoin).to_wif();
        assert!(KeySigner::from_wif(&wif, Network::Regtest).is_err());
        assert!(KeySigner::from_wif("not a key", Network::Regtest).is_err());
    }
}
