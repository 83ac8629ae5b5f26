//! Persisted client identity: an RSA-2048 keypair, a self-signed X.509
//! certificate and the 16-hex unique id derived from the certificate.
//!
//! The same identity must be presented for pairing, pair checks, launch and
//! every stream-level key derivation, so it is created once and reused from
//! `~/.moonparty/` thereafter.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::EncodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256};
use x509_parser::prelude::parse_x509_certificate;

use crate::error::{MoonlightError, Result};

const KEY_BITS: usize = 2048;
const CERT_FILE: &str = "client.crt";
const KEY_FILE: &str = "client.key";
const ID_FILE: &str = "unique_id";

pub struct ClientIdentity {
    private_key: RsaPrivateKey,
    cert_pem: String,
    cert_der: Vec<u8>,
    unique_id: String,
}

impl ClientIdentity {
    /// Load the identity from `dir` (default `~/.moonparty`), generating and
    /// persisting a fresh one if none exists.
    pub fn load_or_generate(dir: Option<&Path>) -> Result<Self> {
        let dir = match dir {
            Some(d) => d.to_path_buf(),
            None => default_dir()?,
        };
        fs::create_dir_all(&dir)?;
        restrict_permissions(&dir, 0o700);

        if dir.join(CERT_FILE).exists() {
            let identity = Self::load(&dir)?;
            info!("[Identity]: loaded existing client identity {}", identity.unique_id);
            return Ok(identity);
        }

        let identity = Self::generate()?;
        identity.persist(&dir)?;
        info!("[Identity]: generated new client identity {}", identity.unique_id);
        Ok(identity)
    }

    /// Generate a fresh identity without touching the filesystem.
    pub fn generate() -> Result<Self> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| MoonlightError::Identity(format!("key generation: {e}")))?;

        let pkcs8_pem = private_key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| MoonlightError::Identity(format!("key encoding: {e}")))?;
        let key_pair =
            rcgen::KeyPair::from_pem_and_sign_algo(&pkcs8_pem, &rcgen::PKCS_RSA_SHA256)
                .map_err(|e| MoonlightError::Identity(format!("rcgen key: {e}")))?;

        let mut params = rcgen::CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "Moonparty");
        params
            .distinguished_name
            .push(rcgen::DnType::OrganizationName, "Moonparty");
        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2044, 1, 1);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| MoonlightError::Identity(format!("certificate: {e}")))?;

        let cert_der = cert.der().to_vec();
        let unique_id = unique_id_from_der(&cert_der);

        Ok(Self {
            private_key,
            cert_pem: cert.pem(),
            cert_der,
            unique_id,
        })
    }

    fn load(dir: &Path) -> Result<Self> {
        let cert_pem = fs::read_to_string(dir.join(CERT_FILE))?;
        let key_pem = fs::read_to_string(dir.join(KEY_FILE))?;
        let unique_id = fs::read_to_string(dir.join(ID_FILE))?.trim().to_string();

        let cert_block = pem::parse(&cert_pem)
            .map_err(|e| MoonlightError::Identity(format!("certificate pem: {e}")))?;
        let private_key = RsaPrivateKey::from_pkcs1_pem(&key_pem)
            .map_err(|e| MoonlightError::Identity(format!("private key pem: {e}")))?;

        Ok(Self {
            private_key,
            cert_der: cert_block.contents().to_vec(),
            cert_pem,
            unique_id,
        })
    }

    fn persist(&self, dir: &Path) -> Result<()> {
        let key_pem = self
            .private_key
            .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
            .map_err(|e| MoonlightError::Identity(format!("key encoding: {e}")))?;

        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);
        let id_path = dir.join(ID_FILE);

        fs::write(&cert_path, &self.cert_pem)?;
        fs::write(&key_path, key_pem.as_bytes())?;
        fs::write(&id_path, &self.unique_id)?;
        restrict_permissions(&cert_path, 0o600);
        restrict_permissions(&key_path, 0o600);
        restrict_permissions(&id_path, 0o600);
        Ok(())
    }

    /// Remove any persisted identity files under `dir`.
    pub fn delete(dir: Option<&Path>) -> Result<()> {
        let dir = match dir {
            Some(d) => d.to_path_buf(),
            None => default_dir()?,
        };
        for file in [CERT_FILE, KEY_FILE, ID_FILE] {
            let _ = fs::remove_file(dir.join(file));
        }
        Ok(())
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn key_pem(&self) -> Result<String> {
        Ok(self
            .private_key
            .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
            .map_err(|e| MoonlightError::Identity(format!("key encoding: {e}")))?
            .to_string())
    }

    /// PKCS1v15-SHA256 signature over `data`, used to authenticate the final
    /// pairing message.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let digest = Sha256::digest(data);
        self.private_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| MoonlightError::Identity(format!("signing: {e}")))
    }

    /// The signature field of our own certificate; pairing mixes it into the
    /// server-challenge hash.
    pub fn cert_signature(&self) -> Result<Vec<u8>> {
        let (_, cert) = parse_x509_certificate(&self.cert_der)
            .map_err(|e| MoonlightError::Identity(format!("certificate parse: {e}")))?;
        Ok(cert.signature_value.data.to_vec())
    }
}

/// `hex(SHA-256(cert_DER)[0..8])`
pub fn unique_id_from_der(cert_der: &[u8]) -> String {
    let digest = Sha256::digest(cert_der);
    hex::encode(&digest[..8])
}

fn default_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".moonparty"))
        .ok_or_else(|| MoonlightError::Identity("no home directory".into()))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_id_is_sixteen_hex_chars() {
        let id = unique_id_from_der(b"not really a certificate");
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generated_identity_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("moonparty-id-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);

        let generated = ClientIdentity::load_or_generate(Some(&dir)).unwrap();
        let loaded = ClientIdentity::load_or_generate(Some(&dir)).unwrap();

        assert_eq!(generated.unique_id(), loaded.unique_id());
        assert_eq!(generated.cert_der(), loaded.cert_der());
        assert_eq!(loaded.unique_id(), unique_id_from_der(loaded.cert_der()));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn signature_is_verifiable_with_cert_key() {
        use rsa::signature::Verifier;
        use rsa::pkcs1v15::{Signature, VerifyingKey};

        let identity = ClientIdentity::generate().unwrap();
        let signature = identity.sign(b"pairing secret").unwrap();

        let verifying_key: VerifyingKey<Sha256> =
            VerifyingKey::new(identity.private_key.to_public_key());
        let signature = Signature::try_from(signature.as_slice()).unwrap();
        assert!(verifying_key
            .verify(b"pairing secret", &signature)
            .is_ok());
    }

    #[test]
    fn cert_signature_is_extractable() {
        let identity = ClientIdentity::generate().unwrap();
        let signature = identity.cert_signature().unwrap();
        // RSA-2048 signatures are 256 bytes.
        assert_eq!(signature.len(), 256);
    }
}
