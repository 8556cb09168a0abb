//! Passwords for newly created roles.

use rand::distributions::Alphanumeric;
use rand::Rng;

pub const PASSWORD_LENGTH: usize = 27;

pub trait PasswordGenerator: Send + Sync {
    fn generate(&self) -> anyhow::Result<String>;
}

/// Random alphanumeric passwords of `PASSWORD_LENGTH` characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomPassword;

impl PasswordGenerator for RandomPassword {
    fn generate(&self) -> anyhow::Result<String> {
        Ok(rand::thread_rng().sample_iter(&Alphanumeric).take(PASSWORD_LENGTH).map(char::from).collect())
    }
}

/// Always the same password.
#[derive(Debug, Clone)]
pub struct StaticPassword(pub String);

impl PasswordGenerator for StaticPassword {
    fn generate(&self) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}
