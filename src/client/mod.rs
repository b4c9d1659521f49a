//! Miniserver connection
//!
//! [`MiniserverConnection`] is the public entry point of the engine. It owns
//! the transport lifecycle behind an atomic state machine: `Constructed →
//! Opening → Open → Disposing → Disposed`, with a rollback to `Constructed`
//! when the open sequence fails. Opening runs the reachability probe, brings
//! up the WebSocket with its receive loop, and performs the authentication
//! handshake before the connection is usable.

pub mod auth;
pub mod command;
pub mod message;
pub(crate) mod socket;

use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::NaiveDateTime;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, Credentials};
use crate::crypto::{CommandEncryption, Encryptor, Session};
use crate::error::{LoxoneError, Result};
use crate::events::EventRouter;
use crate::structure::{StructureFile, STRUCTURE_TIMESTAMP_FORMAT};
use crate::uuid::Uuid;

use auth::{AuthToken, Authenticator};
use command::LxResponse;
use socket::{FaultHandler, TransportSocket};

/// Lifecycle state of a [`MiniserverConnection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Created, credentials may still be set
    Constructed = 0,
    /// An open sequence is running
    Opening = 1,
    /// Authenticated and ready for commands
    Open = 2,
    /// A teardown sequence is running
    Disposing = 3,
    /// Torn down; every operation fails
    Disposed = 4,
}

impl ConnectionState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Constructed,
            1 => ConnectionState::Opening,
            2 => ConnectionState::Open,
            3 => ConnectionState::Disposing,
            _ => ConnectionState::Disposed,
        }
    }
}

/// Dotted firmware version reported by the Miniserver
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
    pub build: u32,
}

impl FirmwareVersion {
    pub const fn new(major: u32, minor: u32, revision: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            revision,
            build,
        }
    }
}

impl FromStr for FirmwareVersion {
    type Err = LoxoneError;

    fn from_str(s: &str) -> Result<Self> {
        let mut fields = [0u32; 4];
        let mut count = 0;
        for part in s.split('.') {
            if count == fields.len() {
                return Err(LoxoneError::parsing(format!("version has too many fields: {s:?}")));
            }
            fields[count] = part
                .parse()
                .map_err(|_| LoxoneError::parsing(format!("malformed version: {s:?}")))?;
            count += 1;
        }
        if count == 0 {
            return Err(LoxoneError::parsing("empty version string"));
        }
        Ok(Self::new(fields[0], fields[1], fields[2], fields[3]))
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.revision, self.build
        )
    }
}

/// What the reachability probe reveals about the Miniserver
#[derive(Debug, Clone, Default)]
pub struct MiniserverInfo {
    /// Serial number
    pub serial_number: Option<String>,
    /// Firmware version
    pub firmware_version: Option<FirmwareVersion>,
}

impl MiniserverInfo {
    fn update(&mut self, api: &ApiInfo) {
        self.serial_number = api.snr.clone();
        self.firmware_version = api.version.as_deref().and_then(|raw| match raw.parse() {
            Ok(version) => Some(version),
            Err(_) => {
                warn!(version = raw, "unparsable firmware version");
                None
            }
        });
    }
}

/// Payload of `jdev/cfg/api`; the Miniserver quotes it with single quotes.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiInfo {
    #[serde(default)]
    pub snr: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl ApiInfo {
    fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(&raw.replace('\'', "\"")).map_err(Into::into)
    }
}

/// Everything that lives exactly as long as one successful open: the socket,
/// the crypto session and the lazily built per-mode encryptors.
struct ActiveLink {
    socket: Arc<TransportSocket>,
    session: Arc<Session>,
    token: CancellationToken,
    request_encryptor: OnceCell<Arc<Encryptor>>,
    full_encryptor: OnceCell<Arc<Encryptor>>,
}

/// Connection to a Loxone Miniserver.
///
/// Safe to share behind an `Arc`; every operation takes `&self` and the
/// lifecycle transitions are atomic. Only one of any number of concurrent
/// `open` or `close` calls wins its transition, the rest fail (or no-op,
/// for `close`).
pub struct MiniserverConnection {
    config: ConnectionConfig,
    credentials: StdMutex<Option<Credentials>>,
    state: AtomicU8,
    info: StdMutex<MiniserverInfo>,
    router: Arc<EventRouter>,
    link: StdMutex<Option<Arc<ActiveLink>>>,
    auth_token: StdMutex<Option<AuthToken>>,
    last_error: Arc<StdMutex<Option<String>>>,
}

impl MiniserverConnection {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            credentials: StdMutex::new(None),
            state: AtomicU8::new(ConnectionState::Constructed as u8),
            info: StdMutex::new(MiniserverInfo::default()),
            router: Arc::new(EventRouter::new()),
            link: StdMutex::new(None),
            auth_token: StdMutex::new(None),
            last_error: Arc::new(StdMutex::new(None)),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_raw(self.state.load(Ordering::SeqCst))
    }

    /// Probe results; empty until an open sequence has run its probe.
    pub fn miniserver_info(&self) -> MiniserverInfo {
        self.info.lock().expect("info poisoned").clone()
    }

    /// The router fanning unsolicited state updates out to subscribers.
    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    /// Token issued by the last token authentication, if any.
    pub fn auth_token(&self) -> Option<AuthToken> {
        self.auth_token.lock().expect("token poisoned").clone()
    }

    /// First internal fault observed on the live connection, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("last error poisoned").clone()
    }

    /// Set the credentials used by the authentication handshake.
    ///
    /// Only allowed before the connection is opened.
    pub fn set_credentials(&self, credentials: Credentials) -> Result<()> {
        self.check_not_disposed()?;
        if self.state() != ConnectionState::Constructed {
            return Err(LoxoneError::InvalidState(
                "credentials can only be set before opening",
            ));
        }
        *self.credentials.lock().expect("credentials poisoned") = Some(credentials);
        Ok(())
    }

    /// Open the connection: probe, connect the WebSocket, authenticate.
    ///
    /// Fails unless the state is `Constructed` with credentials set; exactly
    /// one of several concurrent calls performs the transition. On any
    /// failure the state rolls back to `Constructed` and the original error
    /// propagates, leaving the connection reusable for a retry.
    pub async fn open(&self, cancellation: CancellationToken) -> Result<()> {
        self.check_not_disposed()?;
        let credentials = self
            .credentials
            .lock()
            .expect("credentials poisoned")
            .clone()
            .ok_or(LoxoneError::InvalidState(
                "credentials must be set before opening",
            ))?;

        self.transition(
            ConnectionState::Constructed,
            ConnectionState::Opening,
            "connection is not in the constructed state",
        )?;

        match self.open_link(credentials, &cancellation).await {
            Ok(link) => {
                *self.link.lock().expect("link poisoned") = Some(Arc::clone(&link));
                if self
                    .transition(ConnectionState::Opening, ConnectionState::Open, "disposed")
                    .is_err()
                {
                    // Torn down while opening; release what we just built.
                    self.link.lock().expect("link poisoned").take();
                    link.token.cancel();
                    return Err(LoxoneError::Disposed);
                }
                info!(address = %self.config.address, "connection open");
                Ok(())
            }
            Err(error) => {
                let _ = self.transition(
                    ConnectionState::Opening,
                    ConnectionState::Constructed,
                    "rollback",
                );
                warn!(%error, "opening connection failed");
                Err(error)
            }
        }
    }

    async fn open_link(
        &self,
        credentials: Credentials,
        cancellation: &CancellationToken,
    ) -> Result<Arc<ActiveLink>> {
        if cancellation.is_cancelled() {
            return Err(LoxoneError::Cancelled);
        }
        let token = cancellation.child_token();

        let api = self.probe(&token).await?;
        self.info.lock().expect("info poisoned").update(&api);
        let firmware = self
            .info
            .lock()
            .expect("info poisoned")
            .firmware_version;

        let socket = TransportSocket::connect(
            &self.config,
            Arc::clone(&self.router),
            &token,
            self.fault_handler(token.clone()),
        )
        .await?;

        let authenticator =
            Authenticator::select(self.config.auth_method, firmware.as_ref(), credentials);
        match authenticator.authenticate(&socket).await {
            Ok(issued) => {
                *self.auth_token.lock().expect("token poisoned") = issued;
            }
            Err(error) => {
                token.cancel();
                socket.shutdown().await;
                return Err(error);
            }
        }

        Ok(Arc::new(ActiveLink {
            socket,
            session: Arc::new(Session::new()),
            token,
            request_encryptor: OnceCell::new(),
            full_encryptor: OnceCell::new(),
        }))
    }

    /// Fault funnel for the receive loop: remember the first error, and for
    /// transport/authentication faults cancel the connection scope, which is
    /// the sole mechanism tearing down a live connection from the inside.
    fn fault_handler(&self, connection_token: CancellationToken) -> FaultHandler {
        let last_error = Arc::clone(&self.last_error);
        Arc::new(move |error: LoxoneError| {
            {
                let mut slot = last_error.lock().expect("last error poisoned");
                if slot.is_none() {
                    *slot = Some(error.to_string());
                }
            }
            if error.is_fatal() {
                connection_token.cancel();
            }
        })
    }

    async fn probe(&self, token: &CancellationToken) -> Result<ApiInfo> {
        let url = self
            .config
            .address
            .http_url()?
            .join("jdev/cfg/api")
            .map_err(|e| LoxoneError::parsing(format!("invalid probe url: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(self.config.probe_timeout)
            .build()?;

        let request = async {
            let body = client
                .get(url.clone())
                .send()
                .await?
                .error_for_status()?
                .text()
                .await?;
            let response = LxResponse::parse(&body)?.ensure_success()?;
            let raw = response
                .value_as_str()
                .ok_or_else(|| LoxoneError::parsing("probe returned no api info"))?;
            let api = ApiInfo::parse(raw)?;
            debug!(?api, "miniserver reachable");
            Ok(api)
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(LoxoneError::Cancelled),
            result = request => result,
        }
    }

    /// Send a device command (`jdev/sps/io/<uuid>/<command>`).
    ///
    /// A non-success status code is returned as data in the response, not as
    /// an error.
    pub async fn command(&self, control: Uuid, command: &str) -> Result<LxResponse> {
        self.request_command(&format!("jdev/sps/io/{control}/{command}"))
            .await
    }

    /// Send a raw command through the correlator, applying the configured
    /// default encryption.
    pub async fn request_command(&self, command: &str) -> Result<LxResponse> {
        let link = self.active_link()?;
        let encryptor = self
            .encryptor_for(&link, self.config.default_encryption)
            .await?;
        link.socket.request_command(command, encryptor).await
    }

    /// Send a command whose response is a raw document, not an envelope.
    pub async fn request_string(&self, command: &str) -> Result<String> {
        let link = self.active_link()?;
        link.socket.request_string(command).await
    }

    /// Download and parse the structure description.
    pub async fn download_structure_file(&self) -> Result<StructureFile> {
        let raw = self.request_string("data/LoxAPP3.json").await?;
        StructureFile::parse(&raw)
    }

    /// Last-modified timestamp of the structure description (Miniserver
    /// local time).
    pub async fn structure_file_last_modified(&self) -> Result<NaiveDateTime> {
        let response = self
            .request_command("jdev/sps/LoxAPPversion3")
            .await?
            .ensure_success()?;
        let raw = response
            .value_as_str()
            .ok_or_else(|| LoxoneError::parsing("LoxAPPversion3 returned no timestamp"))?;
        NaiveDateTime::parse_from_str(raw, STRUCTURE_TIMESTAMP_FORMAT)
            .map_err(|e| LoxoneError::parsing(format!("malformed timestamp {raw:?}: {e}")))
    }

    /// Ask the Miniserver to start streaming binary state updates.
    pub async fn enable_status_updates(&self) -> Result<()> {
        self.request_command("jdev/sps/enablebinstatusupdate")
            .await?
            .ensure_success()?;
        Ok(())
    }

    /// Tear the connection down. Idempotent: any number of concurrent calls
    /// results in exactly one release of the socket and session.
    pub async fn close(&self) {
        if !self.claim_teardown() {
            return;
        }

        let link = self.link.lock().expect("link poisoned").take();
        if let Some(link) = link {
            link.token.cancel();
            link.socket.shutdown().await;
        }

        self.state
            .store(ConnectionState::Disposed as u8, Ordering::SeqCst);
        debug!("connection disposed");
    }

    /// Synchronous flavor of [`close`](Self::close) for teardown paths that
    /// cannot await: cancels the connection scope so the receive loop
    /// unwinds and closes the socket on its own.
    pub fn close_nowait(&self) {
        if !self.claim_teardown() {
            return;
        }
        if let Some(link) = self.link.lock().expect("link poisoned").take() {
            link.token.cancel();
        }
        self.state
            .store(ConnectionState::Disposed as u8, Ordering::SeqCst);
    }

    fn active_link(&self) -> Result<Arc<ActiveLink>> {
        match self.state() {
            ConnectionState::Disposing | ConnectionState::Disposed => Err(LoxoneError::Disposed),
            ConnectionState::Open => self
                .link
                .lock()
                .expect("link poisoned")
                .clone()
                .ok_or(LoxoneError::InvalidState("connection has no active transport")),
            _ => Err(LoxoneError::InvalidState("connection is not open")),
        }
    }

    async fn encryptor_for(
        &self,
        link: &ActiveLink,
        mode: CommandEncryption,
    ) -> Result<Option<Arc<Encryptor>>> {
        let cell = match mode {
            CommandEncryption::None => return Ok(None),
            CommandEncryption::Request => &link.request_encryptor,
            CommandEncryption::RequestAndResponse => &link.full_encryptor,
        };

        let encryptor = cell
            .get_or_try_init(|| async {
                link.session.ensure_key_exchange(&link.socket).await?;
                Ok::<_, LoxoneError>(Arc::new(Encryptor::new(Arc::clone(&link.session), mode)))
            })
            .await?;
        Ok(Some(Arc::clone(encryptor)))
    }

    fn transition(
        &self,
        from: ConnectionState,
        to: ConnectionState,
        message: &'static str,
    ) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| LoxoneError::InvalidState(message))
    }

    fn claim_teardown(&self) -> bool {
        loop {
            let current = self.state.load(Ordering::SeqCst);
            if current == ConnectionState::Disposing as u8
                || current == ConnectionState::Disposed as u8
            {
                return false;
            }
            if self
                .state
                .compare_exchange(
                    current,
                    ConnectionState::Disposing as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    fn check_not_disposed(&self) -> Result<()> {
        if self.state.load(Ordering::SeqCst) >= ConnectionState::Disposing as u8 {
            return Err(LoxoneError::Disposed);
        }
        Ok(())
    }
}

impl Drop for MiniserverConnection {
    fn drop(&mut self) {
        self.close_nowait();
    }
}
