//! Four-phase pairing handshake with the host.
//!
//! Both sides derive an AES-128 key from `H(salt || PIN)`; the host holds the
//! phase 1 response open until the user enters the PIN in its admin UI. A
//! successful run leaves the host trusting our client certificate for the
//! lifetime of the identity.

use log::{info, warn};
use rand::RngCore;

use crate::crypto::{decrypt_ecb, derive_pair_key, encrypt_ecb, PairHash, AES_BLOCK_SIZE};
use crate::error::{MoonlightError, PairPhase, Result};
use crate::identity::ClientIdentity;
use crate::network::MoonlightHost;
use crate::types::ServerInformation;

const CHALLENGE_SIZE: usize = 16;
const SECRET_SIZE: usize = 16;

/// The long-term result of pairing: the host's self-signed certificate.
#[derive(Debug, Clone)]
pub struct PairedServer {
    pub server_cert_pem: String,
}

/// Pick the pairing hash for a host generation: SHA-256 for Sunshine and
/// GFE 7+, SHA-1 for older GFE. Never guess — the host version decides.
pub fn pair_hash_for(server: &ServerInformation) -> PairHash {
    if server.is_sunshine() || server.version_tuple()[0] >= 7 {
        PairHash::Sha256
    } else {
        PairHash::Sha1
    }
}

/// Generate a 4-digit PIN for the user to enter on the host.
pub fn generate_pin() -> String {
    let mut bytes = [0u8; 2];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{:04}", u32::from(u16::from_be_bytes(bytes)) % 10_000)
}

pub struct PairingEngine<'a> {
    host: &'a MoonlightHost,
    identity: &'a ClientIdentity,
    hash: PairHash,
}

impl<'a> PairingEngine<'a> {
    pub fn new(host: &'a MoonlightHost, identity: &'a ClientIdentity, hash: PairHash) -> Self {
        Self {
            host,
            identity,
            hash,
        }
    }

    /// Run the full handshake. On any mid-flow failure the pairing state on
    /// the host is cleared with `/unpair` before the error is surfaced.
    pub async fn pair(&self, pin: &str) -> Result<PairedServer> {
        match self.run(pin).await {
            Ok(server) => {
                info!("[Pair]: paired with {}", self.host.address());
                Ok(server)
            }
            Err(err) => {
                warn!("[Pair]: pairing failed, clearing host state: {err}");
                let _ = self.host.unpair(self.identity.unique_id()).await;
                Err(err)
            }
        }
    }

    async fn run(&self, pin: &str) -> Result<PairedServer> {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let session_uuid = uuid::Uuid::new_v4().to_string();

        // Phase 1: announce ourselves and fetch the host certificate. Blocks
        // until the PIN is entered host-side.
        let query = format!(
            "{}&updateState=1&phrase=getservercert&salt={}&clientcert={}",
            self.base_query(&session_uuid),
            hex::encode_upper(salt),
            hex::encode_upper(self.identity.cert_pem().as_bytes()),
        );
        let response = self.host.pair_request(&query).await?;
        if !response.is_paired() {
            return Err(failure(
                PairPhase::GetServerCert,
                response
                    .status_message
                    .unwrap_or_else(|| "host refused to start pairing".into()),
            ));
        }
        let server_cert_hex = response
            .plaincert
            .ok_or_else(|| failure(PairPhase::GetServerCert, "response missing plaincert".into()))?;
        let server_cert_pem = String::from_utf8(
            hex::decode(server_cert_hex.trim())
                .map_err(|e| failure(PairPhase::GetServerCert, format!("bad plaincert hex: {e}")))?,
        )
        .map_err(|e| failure(PairPhase::GetServerCert, format!("bad plaincert encoding: {e}")))?;

        let aes_key = derive_pair_key(self.hash, &salt, pin);

        // Phase 2: send our encrypted challenge, receive the host's hash and
        // counter-challenge.
        let mut client_challenge = [0u8; CHALLENGE_SIZE];
        rand::thread_rng().fill_bytes(&mut client_challenge);
        let sealed_challenge = encrypt_ecb(&aes_key, &client_challenge)?;

        let query = format!(
            "{}&updateState=1&clientchallenge={}",
            self.base_query(&session_uuid),
            hex::encode_upper(&sealed_challenge),
        );
        let response = self.host.pair_request(&query).await?;
        if !response.is_paired() {
            return Err(failure(
                PairPhase::ClientChallenge,
                "challenge rejected".into(),
            ));
        }
        let sealed_response = hex::decode(
            response
                .challengeresponse
                .ok_or_else(|| {
                    failure(PairPhase::ClientChallenge, "response missing challengeresponse".into())
                })?
                .trim(),
        )
        .map_err(|e| failure(PairPhase::ClientChallenge, format!("bad response hex: {e}")))?;
        let decrypted = decrypt_ecb(&aes_key, &sealed_response)?;

        let digest_len = self.hash.digest_len();
        if decrypted.len() < digest_len + CHALLENGE_SIZE {
            return Err(failure(
                PairPhase::ClientChallenge,
                format!("challenge response too short: {}", decrypted.len()),
            ));
        }
        let server_challenge = &decrypted[digest_len..digest_len + CHALLENGE_SIZE];

        // Phase 3: hash the server challenge with our certificate signature
        // and a fresh secret, and send it encrypted.
        let mut client_secret = [0u8; SECRET_SIZE];
        rand::thread_rng().fill_bytes(&mut client_secret);

        let cert_signature = self.identity.cert_signature()?;
        let challenge_hash =
            self.hash
                .digest(&[server_challenge, &cert_signature, &client_secret]);
        let sealed_hash = encrypt_ecb(&aes_key, &pad_to_block(&challenge_hash))?;

        let query = format!(
            "{}&updateState=1&serverchallengeresp={}",
            self.base_query(&session_uuid),
            hex::encode_upper(&sealed_hash),
        );
        let response = self.host.pair_request(&query).await?;
        if !response.is_paired() {
            return Err(failure(
                PairPhase::ServerChallengeResponse,
                "server challenge response rejected".into(),
            ));
        }
        let server_secret = hex::decode(
            response
                .pairingsecret
                .ok_or_else(|| {
                    failure(
                        PairPhase::ServerChallengeResponse,
                        "response missing pairingsecret".into(),
                    )
                })?
                .trim(),
        )
        .map_err(|e| {
            failure(PairPhase::ServerChallengeResponse, format!("bad secret hex: {e}"))
        })?;
        if server_secret.len() < SECRET_SIZE {
            return Err(failure(
                PairPhase::ServerChallengeResponse,
                "server pairing secret too short".into(),
            ));
        }

        // Phase 4: our secret plus its RSA signature, sent in the clear --
        // the signature itself authenticates this message.
        let signature = self.identity.sign(&client_secret)?;
        let mut pairing_secret = Vec::with_capacity(SECRET_SIZE + signature.len());
        pairing_secret.extend_from_slice(&client_secret);
        pairing_secret.extend_from_slice(&signature);

        let query = format!(
            "{}&updateState=1&clientpairingsecret={}",
            self.base_query(&session_uuid),
            hex::encode_upper(&pairing_secret),
        );
        let response = self.host.pair_request(&query).await?;
        if !response.is_paired() {
            return Err(failure(
                PairPhase::ClientPairingSecret,
                "client secret rejected".into(),
            ));
        }

        Ok(PairedServer { server_cert_pem })
    }

    fn base_query(&self, session_uuid: &str) -> String {
        format!(
            "uniqueid={}&uuid={}&devicename={}",
            self.identity.unique_id(),
            session_uuid,
            self.host.device_name(),
        )
    }
}

fn failure(phase: PairPhase, reason: String) -> MoonlightError {
    MoonlightError::PairingFailed { phase, reason }
}

/// Zero-pad to the AES block boundary. SHA-256 hashes are already two exact
/// blocks; SHA-1 hashes on legacy hosts are 20 bytes and need the tail.
fn pad_to_block(data: &[u8]) -> Vec<u8> {
    let padded_len = data.len().div_ceil(AES_BLOCK_SIZE) * AES_BLOCK_SIZE;
    let mut out = vec![0u8; padded_len];
    out[..data.len()].copy_from_slice(data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_is_four_digits() {
        for _ in 0..32 {
            let pin = generate_pin();
            assert_eq!(pin.len(), 4);
            assert!(pin.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn hash_selection_is_version_gated() {
        let sunshine = ServerInformation {
            app_version: "Sunshine 2023.7.1.500".into(),
            ..Default::default()
        };
        assert_eq!(pair_hash_for(&sunshine), PairHash::Sha256);

        let modern_gfe = ServerInformation {
            app_version: "7.1.431.0".into(),
            ..Default::default()
        };
        assert_eq!(pair_hash_for(&modern_gfe), PairHash::Sha256);

        let legacy_gfe = ServerInformation {
            app_version: "3.20.0.0".into(),
            ..Default::default()
        };
        assert_eq!(pair_hash_for(&legacy_gfe), PairHash::Sha1);
    }

    #[test]
    fn sha1_hash_material_pads_to_two_blocks() {
        assert_eq!(pad_to_block(&[1u8; 20]).len(), 32);
        assert_eq!(pad_to_block(&[1u8; 32]).len(), 32);
    }
}
