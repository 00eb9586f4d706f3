//! Protected-session lifecycle.
//!
//! # Responsibility
//! - Store passphrase-wrapped key material in instance options.
//! - Hold the unwrapped data key for a bounded time after verification.
//!
//! # Invariants
//! - The data key exists in memory only between a successful `start` and
//!   logout or expiry; an expired key is dropped on the next access.
//! - The passphrase and key-encryption key are never persisted.

use crate::protect::crypto::{
    decrypt_bytes, derive_key, encrypt_bytes, random_bytes, verification_hash, CryptoError,
    DataKey, KEY_LEN, SALT_LEN,
};
use crate::repo::entity_store::{StoreError, StoreResult};
use crate::repo::options_repo::{get_option, set_option};
use crate::repo::write_scope::with_write_scope;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{info, warn};
use parking_lot::RwLock;
use rusqlite::Connection;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

const OPTION_SALT: &str = "protected_password_salt";
const OPTION_VERIFICATION: &str = "protected_password_verification";
const OPTION_WRAPPED_KEY: &str = "protected_data_key";

#[derive(Debug)]
pub enum SessionError {
    /// No live session: never started, logged out, or expired.
    Unavailable,
    PasswordNotSet,
    PasswordAlreadySet,
    EmptyPassphrase,
    WrongPassword,
    Crypto(CryptoError),
    Storage(StoreError),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable => "session_unavailable",
            Self::PasswordNotSet => "password_not_set",
            Self::PasswordAlreadySet => "password_already_set",
            Self::EmptyPassphrase => "empty_passphrase",
            Self::WrongPassword => "wrong_password",
            Self::Crypto(_) => "crypto_failed",
            Self::Storage(_) => "storage_failed",
        }
    }
}

impl Display for SessionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "protected session is not available"),
            Self::PasswordNotSet => write!(f, "protected password has not been set up"),
            Self::PasswordAlreadySet => write!(f, "protected password is already set up"),
            Self::EmptyPassphrase => write!(f, "passphrase cannot be empty"),
            Self::WrongPassword => write!(f, "passphrase does not match"),
            Self::Crypto(err) => write!(f, "{err}"),
            Self::Storage(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SessionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Crypto(err) => Some(err),
            Self::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CryptoError> for SessionError {
    fn from(value: CryptoError) -> Self {
        Self::Crypto(value)
    }
}

impl From<StoreError> for SessionError {
    fn from(value: StoreError) -> Self {
        Self::Storage(value)
    }
}

/// Source of the protected-note key, injected into services.
pub trait ProtectedSessionProvider: Send + Sync {
    fn is_available(&self) -> bool;
    /// Live key, or `SessionError::Unavailable`.
    fn current_key(&self) -> Result<DataKey, SessionError>;
}

/// Whether protected password material exists on this instance.
pub fn is_password_set(conn: &Connection) -> StoreResult<bool> {
    Ok(get_option(conn, OPTION_WRAPPED_KEY)?.is_some())
}

/// Generates the data key and stores it wrapped under `passphrase`.
pub fn setup_password(conn: &Connection, passphrase: &str) -> Result<(), SessionError> {
    if passphrase.is_empty() {
        return Err(SessionError::EmptyPassphrase);
    }
    if is_password_set(conn)? {
        return Err(SessionError::PasswordAlreadySet);
    }
    let data_key = DataKey::generate();
    store_wrapped_key(conn, passphrase, &data_key)?;
    info!("event=protected_password_setup module=protect status=ok");
    Ok(())
}

/// Rewraps the existing data key under a new passphrase.
///
/// Protected notes stay readable because the data key itself is unchanged.
pub fn change_password(
    conn: &Connection,
    current_passphrase: &str,
    new_passphrase: &str,
) -> Result<(), SessionError> {
    if new_passphrase.is_empty() {
        return Err(SessionError::EmptyPassphrase);
    }
    let data_key = unwrap_data_key(conn, current_passphrase)?;
    store_wrapped_key(conn, new_passphrase, &data_key)?;
    info!("event=protected_password_change module=protect status=ok");
    Ok(())
}

fn store_wrapped_key(
    conn: &Connection,
    passphrase: &str,
    data_key: &DataKey,
) -> Result<(), SessionError> {
    let salt: [u8; SALT_LEN] = random_bytes();
    let wrapping_key = derive_key(passphrase, &salt)?;
    let wrapped = encrypt_bytes(&wrapping_key, data_key.as_bytes())?;

    with_write_scope::<_, SessionError, _>(conn, || {
        set_option(conn, OPTION_SALT, &STANDARD.encode(salt))?;
        set_option(
            conn,
            OPTION_VERIFICATION,
            &verification_hash(&wrapping_key, &salt),
        )?;
        set_option(conn, OPTION_WRAPPED_KEY, &STANDARD.encode(wrapped))?;
        Ok(())
    })
}

fn unwrap_data_key(conn: &Connection, passphrase: &str) -> Result<DataKey, SessionError> {
    let (Some(salt), Some(verification), Some(wrapped)) = (
        get_option(conn, OPTION_SALT)?,
        get_option(conn, OPTION_VERIFICATION)?,
        get_option(conn, OPTION_WRAPPED_KEY)?,
    ) else {
        return Err(SessionError::PasswordNotSet);
    };

    let salt = decode_option(OPTION_SALT, &salt)?;
    let wrapping_key = derive_key(passphrase, &salt)?;
    if verification_hash(&wrapping_key, &salt) != verification {
        return Err(SessionError::WrongPassword);
    }

    let raw = Zeroizing::new(decrypt_bytes(
        &wrapping_key,
        &decode_option(OPTION_WRAPPED_KEY, &wrapped)?,
    )?);
    let bytes: [u8; KEY_LEN] = raw
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::Malformed(format!("data key has {} bytes", raw.len())))?;
    Ok(DataKey::from_bytes(bytes))
}

fn decode_option(name: &str, value: &str) -> Result<Vec<u8>, SessionError> {
    STANDARD
        .decode(value.as_bytes())
        .map_err(|err| SessionError::Crypto(CryptoError::Malformed(format!("{name}: {err}"))))
}

struct ActiveSession {
    key: DataKey,
    expires_at: Instant,
}

/// Process-wide holder of the unwrapped data key.
///
/// Share it behind an `Arc` and hand it to services as a
/// `ProtectedSessionProvider`.
pub struct SessionManager {
    timeout: Duration,
    active: RwLock<Option<ActiveSession>>,
}

impl SessionManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            active: RwLock::new(None),
        }
    }

    /// Verifies `passphrase` and opens a session.
    pub fn start(&self, conn: &Connection, passphrase: &str) -> Result<(), SessionError> {
        match unwrap_data_key(conn, passphrase) {
            Ok(key) => {
                self.start_with_key(key);
                Ok(())
            }
            Err(err) => {
                warn!(
                    "event=protected_session module=protect status=error action=start error_code={}",
                    err.code()
                );
                Err(err)
            }
        }
    }

    /// Opens a session with an already unwrapped key.
    pub fn start_with_key(&self, key: DataKey) {
        *self.active.write() = Some(ActiveSession {
            key,
            expires_at: Instant::now() + self.timeout,
        });
        info!(
            "event=protected_session module=protect status=ok action=start timeout_secs={}",
            self.timeout.as_secs()
        );
    }

    pub fn logout(&self) {
        if self.active.write().take().is_some() {
            info!("event=protected_session module=protect status=ok action=logout");
        }
    }

    /// Extends a live session by the full timeout. Returns `false` when no
    /// session is live.
    pub fn touch(&self) -> bool {
        let mut active = self.active.write();
        match active.as_mut() {
            Some(session) if session.expires_at > Instant::now() => {
                session.expires_at = Instant::now() + self.timeout;
                true
            }
            Some(_) => {
                *active = None;
                info!("event=protected_session module=protect status=ok action=expire");
                false
            }
            None => false,
        }
    }

    /// Time left before expiry, `None` when no session is live.
    pub fn remaining(&self) -> Option<Duration> {
        self.active
            .read()
            .as_ref()
            .and_then(|session| session.expires_at.checked_duration_since(Instant::now()))
            .filter(|left| !left.is_zero())
    }
}

impl ProtectedSessionProvider for SessionManager {
    fn is_available(&self) -> bool {
        self.remaining().is_some()
    }

    fn current_key(&self) -> Result<DataKey, SessionError> {
        {
            let active = self.active.read();
            match active.as_ref() {
                Some(session) if session.expires_at > Instant::now() => {
                    return Ok(session.key.clone());
                }
                None => return Err(SessionError::Unavailable),
                Some(_) => {}
            }
        }
        let mut active = self.active.write();
        if active
            .as_ref()
            .is_some_and(|session| session.expires_at <= Instant::now())
        {
            *active = None;
            info!("event=protected_session module=protect status=ok action=expire");
        }
        Err(SessionError::Unavailable)
    }
}
