//! Cryptography for the Miniserver session
//!
//! The Miniserver publishes an RSA public key; the client generates an
//! AES-256 session key, hands it over RSA-encrypted through `keyexchange`,
//! and may then wrap individual commands in AES-256-CBC. The key exchange
//! happens at most once per session, lazily, the first time an encrypting
//! command goes out.

use std::sync::Arc;

use openssl::hash::{hash, MessageDigest};
use openssl::pkey::PKey;
use openssl::rsa::{Padding, Rsa};
use openssl::sign::Signer;
use openssl::symm::{decrypt, encrypt, Cipher};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;

use base64::{engine::general_purpose, Engine as _};

use crate::client::socket::TransportSocket;
use crate::error::{LoxoneError, Result};

/// Encryption applied to an outgoing command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandEncryption {
    /// Plain text command and response
    #[default]
    None,
    /// Encrypt the outgoing command text only
    Request,
    /// Encrypt the outgoing command and decrypt the JSON response
    RequestAndResponse,
}

/// Per-connection crypto session.
///
/// Holds the generated AES-256 key and IV; the key exchange with the
/// Miniserver runs exactly once regardless of how many encryptors share the
/// session.
pub(crate) struct Session {
    aes_key: [u8; 32],
    aes_iv: [u8; 16],
    exchanged: OnceCell<()>,
}

impl Session {
    pub(crate) fn new() -> Self {
        let mut aes_key = [0u8; 32];
        let mut aes_iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut aes_key);
        rand::thread_rng().fill_bytes(&mut aes_iv);
        Self {
            aes_key,
            aes_iv,
            exchanged: OnceCell::new(),
        }
    }

    /// Fetch the server's public key and hand over the session key, once.
    pub(crate) async fn ensure_key_exchange(&self, socket: &TransportSocket) -> Result<()> {
        self.exchanged
            .get_or_try_init(|| async {
                let response = socket
                    .request_command("jdev/sys/getPublicKey", None)
                    .await?
                    .ensure_success()?;
                let certificate = response.value_as_str().ok_or_else(|| {
                    LoxoneError::authentication("getPublicKey returned no certificate")
                })?;
                let rsa = import_public_key(certificate)?;

                let session_key =
                    format!("{}:{}", hex::encode(self.aes_key), hex::encode(self.aes_iv));
                let mut encrypted = vec![0u8; rsa.size() as usize];
                let encrypted_len = rsa
                    .public_encrypt(session_key.as_bytes(), &mut encrypted, Padding::PKCS1)
                    .map_err(|e| LoxoneError::crypto(format!("session key encryption failed: {e}")))?;
                encrypted.truncate(encrypted_len);

                let exchange = format!(
                    "jdev/sys/keyexchange/{}",
                    general_purpose::STANDARD.encode(&encrypted)
                );
                socket.request_command(&exchange, None).await?.ensure_success()?;
                debug!("session key exchange completed");
                Ok(())
            })
            .await
            .copied()
    }

    fn encrypt_payload(&self, plaintext: &str) -> Result<Vec<u8>> {
        encrypt(
            Cipher::aes_256_cbc(),
            &self.aes_key,
            Some(&self.aes_iv),
            plaintext.as_bytes(),
        )
        .map_err(|e| LoxoneError::crypto(format!("command encryption failed: {e}")))
    }

    fn decrypt_payload(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        decrypt(
            Cipher::aes_256_cbc(),
            &self.aes_key,
            Some(&self.aes_iv),
            ciphertext,
        )
        .map_err(|e| LoxoneError::crypto(format!("response decryption failed: {e}")))
    }
}

/// Encode/decode capability for one [`CommandEncryption`] mode.
pub struct Encryptor {
    session: Arc<Session>,
    mode: CommandEncryption,
}

impl Encryptor {
    pub(crate) fn new(session: Arc<Session>, mode: CommandEncryption) -> Self {
        Self { session, mode }
    }

    pub(crate) fn mode(&self) -> CommandEncryption {
        self.mode
    }

    /// Wrap a plain command into its encrypted `enc`/`fenc` form.
    pub(crate) fn encode_command(&self, command: &str) -> Result<String> {
        let prefix = match self.mode {
            CommandEncryption::None => return Ok(command.to_string()),
            CommandEncryption::Request => "jdev/sys/enc",
            CommandEncryption::RequestAndResponse => "jdev/sys/fenc",
        };

        let mut salt = [0u8; 2];
        rand::thread_rng().fill_bytes(&mut salt);
        let plaintext = format!("salt/{}/{}", hex::encode(salt), command);

        let ciphertext = self.session.encrypt_payload(&plaintext)?;
        let encoded = general_purpose::STANDARD.encode(&ciphertext);
        Ok(format!("{prefix}/{}", urlencoding::encode(&encoded)))
    }

    /// Decrypt an encrypted JSON response back into its text.
    pub(crate) fn decode_response(&self, text: &str) -> Result<String> {
        let ciphertext = general_purpose::STANDARD
            .decode(text.trim_end_matches('\0'))
            .map_err(|e| LoxoneError::crypto(format!("response is not valid base64: {e}")))?;
        let plaintext = self.session.decrypt_payload(&ciphertext)?;
        String::from_utf8(plaintext)
            .map_err(|e| LoxoneError::crypto(format!("decrypted response is not UTF-8: {e}")))
    }
}

/// Import the server's RSA public key from its certificate material.
///
/// The Miniserver hands out SubjectPublicKeyInfo DER wrapped in PEM markers;
/// some firmware versions use PKCS#1. Malformed material is a fatal
/// authentication error, there is no local recovery.
pub(crate) fn import_public_key(certificate: &str) -> Result<Rsa<openssl::pkey::Public>> {
    let stripped = certificate
        .replace("-----BEGIN CERTIFICATE-----", "")
        .replace("-----END CERTIFICATE-----", "")
        .replace("-----BEGIN PUBLIC KEY-----", "")
        .replace("-----END PUBLIC KEY-----", "")
        .replace(['\n', '\r', ' '], "");

    let der = general_purpose::STANDARD.decode(&stripped).map_err(|e| {
        LoxoneError::authentication(format!("certificate is not valid base64: {e}"))
    })?;

    Rsa::public_key_from_der(&der)
        .or_else(|_| Rsa::public_key_from_der_pkcs1(&der))
        .map_err(|e| {
            LoxoneError::authentication(format!("invalid X.509/ASN.1-DER certificate: {e}"))
        })
}

/// Hex digest of `data`, uppercased, using the server-announced algorithm.
pub(crate) fn digest_hex(algorithm: &str, data: &str) -> Result<String> {
    let digest = message_digest(algorithm);
    let hashed = hash(digest, data.as_bytes())
        .map_err(|e| LoxoneError::crypto(format!("hashing failed: {e}")))?;
    Ok(hex::encode(hashed).to_uppercase())
}

/// Hex HMAC of `data` keyed with `key`, uppercased.
pub(crate) fn hmac_hex(algorithm: &str, key: &[u8], data: &str) -> Result<String> {
    let pkey =
        PKey::hmac(key).map_err(|e| LoxoneError::crypto(format!("invalid HMAC key: {e}")))?;
    let mut signer = Signer::new(message_digest(algorithm), &pkey)
        .map_err(|e| LoxoneError::crypto(format!("HMAC setup failed: {e}")))?;
    signer
        .update(data.as_bytes())
        .map_err(|e| LoxoneError::crypto(format!("HMAC update failed: {e}")))?;
    let mac = signer
        .sign_to_vec()
        .map_err(|e| LoxoneError::crypto(format!("HMAC signing failed: {e}")))?;
    Ok(hex::encode(mac).to_uppercase())
}

fn message_digest(algorithm: &str) -> MessageDigest {
    if algorithm.eq_ignore_ascii_case("SHA256") {
        MessageDigest::sha256()
    } else {
        MessageDigest::sha1()
    }
}
