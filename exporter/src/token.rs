use crate::errors::{AuthError, Error, Result};
use crate::metrics::{REAUTHORIZATION_REQUIRED, TOKEN_REFRESHES_TOTAL};
use crate::model::Credential;
use async_trait::async_trait;
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Refresh an access token 60s before the tracked expiry.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Something that can trade a refresh token for a new credential.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> std::result::Result<Credential, AuthError>;
}

/// Where rotated credentials are written so a restart does not lose them.
pub trait CredentialPersister: Send + Sync {
    fn load(&self) -> Result<Option<Credential>>;
    fn save(&self, credential: &Credential) -> Result<()>;
}

/// Keeps credentials in memory only.
pub struct NoopPersister;

impl CredentialPersister for NoopPersister {
    fn load(&self) -> Result<Option<Credential>> {
        Ok(None)
    }

    fn save(&self, _credential: &Credential) -> Result<()> {
        Ok(())
    }
}

/// JSON file, replaced atomically through a sibling temp file.
pub struct FilePersister {
    path: PathBuf,
}

impl FilePersister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CredentialPersister for FilePersister {
    fn load(&self) -> Result<Option<Credential>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let credential: Credential = serde_json::from_slice(&raw)?;
        if !credential.has_refresh_token() {
            return Err(Error::Persist(format!(
                "{} holds an empty refresh token",
                self.path.display()
            )));
        }
        Ok(Some(credential))
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        let tmp = self.temp_path();
        let payload = serde_json::to_vec_pretty(credential)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&tmp)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Sole owner of the exporter's OAuth2 credential.
///
/// Refreshes are serialised: the refresh token is single-use, so two
/// concurrent exchanges would invalidate each other.
pub struct TokenStore {
    endpoint: Arc<dyn TokenEndpoint>,
    persister: Box<dyn CredentialPersister>,
    credential: RwLock<Credential>,
    // Set once a token obtained in this process has been handed out.
    validated: AtomicBool,
    reauthorization_required: AtomicBool,
    refresh_lock: Mutex<()>,
}

impl TokenStore {
    pub fn new(
        endpoint: Arc<dyn TokenEndpoint>,
        persister: Box<dyn CredentialPersister>,
        credential: Credential,
    ) -> Self {
        Self {
            endpoint,
            persister,
            credential: RwLock::new(credential),
            validated: AtomicBool::new(false),
            reauthorization_required: AtomicBool::new(false),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Builds a store from the persisted credential, falling back to the
    /// refresh token supplied through configuration.
    pub fn load(
        endpoint: Arc<dyn TokenEndpoint>,
        persister: Box<dyn CredentialPersister>,
        configured_refresh_token: Option<String>,
    ) -> Result<Self> {
        let configured = configured_refresh_token.filter(|t| !t.trim().is_empty());

        let credential = match (persister.load()?, configured) {
            (Some(stored), _) => {
                info!("Loaded persisted credential");
                stored
            }
            (None, Some(token)) => {
                let credential = Credential::from_refresh_token(token);
                persister.save(&credential)?;
                credential
            }
            (None, None) => {
                warn!("No refresh token configured; authorize the exporter through its web page");
                Credential::default()
            }
        };

        Ok(Self::new(endpoint, persister, credential))
    }

    pub fn current(&self) -> Credential {
        self.credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_authorized(&self) -> bool {
        self.current().has_refresh_token()
    }

    /// True after the identity endpoint permanently rejected the stored
    /// credential, until a refresh, a callback or a cycle succeeds.
    pub fn needs_reauthorization(&self) -> bool {
        self.reauthorization_required.load(Ordering::SeqCst)
    }

    /// Clears the re-authorization alarm.
    pub fn mark_healthy(&self) {
        self.set_alarm(false);
    }

    /// Returns a credential usable for an immediate API call, refreshing it
    /// first when none was obtained yet in this process or it is expiring.
    pub async fn ensure_valid(&self) -> std::result::Result<Credential, AuthError> {
        if let Some(credential) = self.usable() {
            return Ok(credential);
        }

        let _permit = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(credential) = self.usable() {
            return Ok(credential);
        }

        let current = self.current();
        self.refresh_locked(&current).await
    }

    /// Refreshes after the telemetry endpoint rejected `rejected_access_token`.
    /// If the store already moved past that token, the newer one is returned
    /// without another exchange.
    pub async fn force_refresh(
        &self,
        rejected_access_token: &str,
    ) -> std::result::Result<Credential, AuthError> {
        let _permit = self.refresh_lock.lock().await;

        let current = self.current();
        if current.has_access_token() && current.access_token != rejected_access_token {
            debug!("Access token already rotated by another caller");
            return Ok(current);
        }

        self.refresh_locked(&current).await
    }

    /// Installs a credential obtained outside the refresh flow (the consent
    /// callback). Waits for any in-flight refresh so the two cannot interleave.
    pub async fn authorize(&self, credential: Credential) -> Result<()> {
        let _permit = self.refresh_lock.lock().await;
        self.record_rotation(credential)
    }

    /// Replaces the stored credential and writes it through to the persister.
    /// The in-memory value is swapped even when persisting fails. Callers
    /// must hold `refresh_lock`.
    fn record_rotation(&self, credential: Credential) -> Result<()> {
        {
            let mut guard = self
                .credential
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *guard = credential.clone();
        }
        self.validated.store(true, Ordering::SeqCst);
        self.set_alarm(false);

        self.persister.save(&credential)
    }

    fn set_alarm(&self, raised: bool) {
        self.reauthorization_required.store(raised, Ordering::SeqCst);
        REAUTHORIZATION_REQUIRED.set(i64::from(raised));
    }

    fn usable(&self) -> Option<Credential> {
        let credential = self.current();
        let expiring =
            credential.expires_within(Utc::now(), chrono::Duration::seconds(EXPIRY_MARGIN_SECS));

        (credential.has_access_token() && self.validated.load(Ordering::SeqCst) && !expiring)
            .then_some(credential)
    }

    async fn refresh_locked(
        &self,
        current: &Credential,
    ) -> std::result::Result<Credential, AuthError> {
        if !current.has_refresh_token() {
            self.set_alarm(true);
            return Err(AuthError::Permanent(
                "no refresh token held; authorization required".to_string(),
            ));
        }

        match self.endpoint.refresh(&current.refresh_token).await {
            Ok(fresh) => {
                TOKEN_REFRESHES_TOTAL.with_label_values(&["success"]).inc();
                if let Err(e) = self.record_rotation(fresh.clone()) {
                    // The old refresh token is already dead upstream.
                    error!("Failed to persist rotated credential: {}", e);
                }
                info!("Access token refreshed");
                Ok(fresh)
            }
            Err(e) => {
                TOKEN_REFRESHES_TOTAL.with_label_values(&[e.kind()]).inc();
                if e.is_permanent() {
                    self.set_alarm(true);
                }
                Err(e)
            }
        }
    }
}
