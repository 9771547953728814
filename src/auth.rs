use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const MIN_PASSWORD_LEN: usize = 6;

/// Account roles, ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Guest,
    Siswa,
    Guru,
    Admin,
}

impl Role {
    pub fn rank(self) -> u8 {
        match self {
            Role::Guest => 0,
            Role::Siswa => 1,
            Role::Guru => 2,
            Role::Admin => 3,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "guest" => Some(Role::Guest),
            "siswa" => Some(Role::Siswa),
            "guru" => Some(Role::Guru),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::Siswa => "siswa",
            Role::Guru => "guru",
            Role::Admin => "admin",
        }
    }
}

pub fn has_permission(current: Role, required: Role) -> bool {
    current.rank() >= required.rank()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("username and password are required")]
    MissingCredentials,
    #[error("password and confirmation do not match")]
    ConfirmationMismatch,
    #[error("password must be at least {} characters", MIN_PASSWORD_LEN)]
    PasswordTooShort,
    #[error("email must look like name@domain")]
    InvalidEmail,
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("current password is incorrect")]
    WrongCurrentPassword,
}

impl AuthError {
    /// IPC error code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials | AuthError::WrongCurrentPassword => "unauthorized",
            _ => "bad_params",
        }
    }
}

/// The signed-in user as kept in the session store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    pub id: String,
    pub username: String,
    pub nama: String,
    pub email: String,
    pub role: Role,
    #[serde(default)]
    pub kelas: Option<String>,
    #[serde(default)]
    pub nis: Option<String>,
}

pub fn check_credentials(username: &str, password: &str) -> Result<(), AuthError> {
    if username.trim().is_empty() || password.is_empty() {
        return Err(AuthError::MissingCredentials);
    }
    Ok(())
}

pub fn check_new_password(password: &str, confirm: &str) -> Result<(), AuthError> {
    if password != confirm {
        return Err(AuthError::ConfirmationMismatch);
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::PasswordTooShort);
    }
    Ok(())
}

/// Usernames are the local part of the account e-mail.
pub fn username_from_email(email: &str) -> Result<String, AuthError> {
    let Some((local, domain)) = email.trim().split_once('@') else {
        return Err(AuthError::InvalidEmail);
    };
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(AuthError::InvalidEmail);
    }
    Ok(local.to_string())
}

pub fn new_salt() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn new_session_token() -> String {
    format!("session-{}", Uuid::new_v4())
}

pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

pub fn verify_password(salt: &str, password: &str, expected_hash: &str) -> bool {
    hash_password(salt, password) == expected_hash
}
