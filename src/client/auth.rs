//! Authentication handshakes
//!
//! Two handshake generations exist. Firmware before 9.0 only understands the
//! legacy hash authentication (`getkey` + `authenticate`); 9.0 and newer
//! issue JWT-style tokens (`getkey2` + `getjwt`). When no method is
//! configured explicitly, the firmware version reported by the reachability
//! probe decides. Both handshakes run over the already-open socket, through
//! the same command channel as everything else.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::socket::TransportSocket;
use crate::client::FirmwareVersion;
use crate::config::{AuthenticationMethod, Credentials};
use crate::crypto::{digest_hex, hmac_hex};
use crate::error::{LoxoneError, Result};

/// Firmware version from which token authentication is used.
pub(crate) const TOKEN_AUTH_THRESHOLD: FirmwareVersion = FirmwareVersion::new(9, 0, 0, 0);

/// Permission level requested with the token (4 = app permission).
const TOKEN_PERMISSION: &str = "4";

/// Client identifier presented to the Miniserver when requesting a token.
const CLIENT_ID: &str = "098802e1-02b4-603c-ffffb2d6efc8b5b6";
const CLIENT_INFO: &str = "loxone-client-rust";

/// Authentication token issued by the Miniserver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    /// JWT token string
    pub token: String,

    /// Key for follow-up token hashing
    #[serde(default)]
    pub key: String,

    /// Salt used during token acquisition
    #[serde(default)]
    pub salt: String,

    /// Expiration timestamp (seconds since 2009-01-01, Miniserver epoch)
    #[serde(rename = "validUntil")]
    pub valid_until: i64,

    /// Granted permission mask
    #[serde(rename = "tokenRights", default)]
    pub token_rights: i32,

    /// Set when the password used is considered weak
    #[serde(rename = "unsecurePass", default)]
    pub unsecure_pass: bool,
}

/// The selected handshake variant
pub(crate) enum Authenticator {
    Password(Credentials),
    Token(Credentials),
}

impl Authenticator {
    /// Pick the handshake for the configured method; `Default` resolves
    /// against the firmware version reported by the probe. An explicit
    /// non-default method always wins.
    pub(crate) fn select(
        method: AuthenticationMethod,
        firmware: Option<&FirmwareVersion>,
        credentials: Credentials,
    ) -> Self {
        match method {
            AuthenticationMethod::Password => Authenticator::Password(credentials),
            AuthenticationMethod::Token => Authenticator::Token(credentials),
            AuthenticationMethod::Default => match firmware {
                Some(version) if *version < TOKEN_AUTH_THRESHOLD => {
                    Authenticator::Password(credentials)
                }
                _ => Authenticator::Token(credentials),
            },
        }
    }

    /// Run the handshake over the open socket. Token authentication yields
    /// the issued token; password authentication has no artifact.
    pub(crate) async fn authenticate(&self, socket: &TransportSocket) -> Result<Option<AuthToken>> {
        match self {
            Authenticator::Password(credentials) => {
                authenticate_password(socket, credentials).await?;
                Ok(None)
            }
            Authenticator::Token(credentials) => {
                authenticate_token(socket, credentials).await.map(Some)
            }
        }
    }
}

async fn authenticate_password(socket: &TransportSocket, credentials: &Credentials) -> Result<()> {
    let response = socket
        .request_command("jdev/sys/getkey", None)
        .await?
        .ensure_success()
        .map_err(reject)?;
    let key_hex = response
        .value_as_str()
        .ok_or_else(|| LoxoneError::authentication("getkey returned no key"))?;
    let key = hex::decode(key_hex)
        .map_err(|e| LoxoneError::authentication(format!("getkey returned malformed key: {e}")))?;

    let hash = hmac_hex(
        "SHA1",
        &key,
        &format!("{}:{}", credentials.username, credentials.password),
    )?;

    socket
        .request_command(&format!("authenticate/{hash}"), None)
        .await?
        .ensure_success()
        .map_err(reject)?;
    debug!("password authentication accepted");
    Ok(())
}

async fn authenticate_token(
    socket: &TransportSocket,
    credentials: &Credentials,
) -> Result<AuthToken> {
    let response = socket
        .request_command(
            &format!("jdev/sys/getkey2/{}", credentials.username),
            None,
        )
        .await?
        .ensure_success()
        .map_err(reject)?;

    let key = response.value["key"]
        .as_str()
        .ok_or_else(|| LoxoneError::authentication("getkey2 returned no key"))?;
    let salt = response.value["salt"]
        .as_str()
        .ok_or_else(|| LoxoneError::authentication("getkey2 returned no salt"))?;
    let hash_alg = response.value["hashAlg"].as_str().unwrap_or("SHA1").to_string();

    let pw_hash = digest_hex(&hash_alg, &format!("{}:{}", credentials.password, salt))?;
    let key_bytes = hex::decode(key)
        .map_err(|e| LoxoneError::authentication(format!("getkey2 returned malformed key: {e}")))?;
    let hash = hmac_hex(
        &hash_alg,
        &key_bytes,
        &format!("{}:{}", credentials.username, pw_hash),
    )?;

    let request = format!(
        "jdev/sys/getjwt/{}/{}/{}/{}/{}",
        hash,
        urlencoding::encode(&credentials.username),
        TOKEN_PERMISSION,
        CLIENT_ID,
        urlencoding::encode(CLIENT_INFO),
    );
    let response = socket
        .request_command(&request, None)
        .await?
        .ensure_success()
        .map_err(reject)?;

    let token: AuthToken = serde_json::from_value(response.value)
        .map_err(|e| LoxoneError::authentication(format!("malformed token response: {e}")))?;
    debug!(valid_until = token.valid_until, "token authentication accepted");
    Ok(token)
}

/// A non-success status during the handshake means the credential was
/// rejected; that is an authentication failure, not a command result.
fn reject(err: LoxoneError) -> LoxoneError {
    match err {
        LoxoneError::CommandStatus(code) => {
            LoxoneError::authentication(format!("credential rejected with status {code}"))
        }
        other => other,
    }
}
