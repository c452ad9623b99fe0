//! Email/password verification.

use anyhow::Context;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::{
    error::{AuthError, AuthResult},
    models::Identity,
    store::IdentityStore,
    validation::normalize_email,
};

pub trait PasswordHasher: Send + Sync {
    /// # Errors
    /// Returns an error if hashing fails.
    fn hash(&self, password: &str) -> anyhow::Result<String>;

    /// A malformed stored hash verifies as `false`.
    fn verify(&self, password: &str, hash: &str) -> bool;
}

#[derive(Clone, Copy, Debug)]
pub struct BcryptHasher {
    cost: u32,
}

impl BcryptHasher {
    #[must_use]
    pub const fn new(cost: u32) -> Self {
        Self { cost }
    }
}

impl Default for BcryptHasher {
    fn default() -> Self {
        Self::new(bcrypt::DEFAULT_COST)
    }
}

impl PasswordHasher for BcryptHasher {
    fn hash(&self, password: &str) -> anyhow::Result<String> {
        bcrypt::hash(password, self.cost).context("failed to hash password")
    }

    fn verify(&self, password: &str, hash: &str) -> bool {
        bcrypt::verify(password, hash).unwrap_or(false)
    }
}

pub struct CredentialVerifier {
    store: Arc<dyn IdentityStore>,
    hasher: Arc<dyn PasswordHasher>,
    // Verified against when the email is unknown so both failure paths cost
    // one hash comparison.
    dummy_hash: String,
}

impl CredentialVerifier {
    /// # Errors
    /// Returns an error if the placeholder hash cannot be computed.
    pub fn new(
        store: Arc<dyn IdentityStore>,
        hasher: Arc<dyn PasswordHasher>,
    ) -> anyhow::Result<Self> {
        let dummy_hash = hasher.hash("umbral-placeholder-password")?;
        Ok(Self {
            store,
            hasher,
            dummy_hash,
        })
    }

    /// Returns the identity only if the password matches and the account is
    /// enabled. Unknown email and wrong password yield the same error.
    ///
    /// # Errors
    /// [`AuthError::InvalidCredentials`], [`AuthError::InactiveUser`], or an
    /// infrastructure error from the store.
    #[instrument(skip(self, password))]
    pub async fn verify(&self, email: &str, password: &str) -> AuthResult<Identity> {
        let email = normalize_email(email);
        let identity = self.store.find_by_email(&email).await?;

        let hash = identity
            .as_ref()
            .map_or_else(|| self.dummy_hash.clone(), |found| found.password_hash.clone());
        let password = password.to_string();
        let hasher = Arc::clone(&self.hasher);
        let matches = tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .context("password verification task failed")?;

        let Some(identity) = identity.filter(|_| matches) else {
            debug!("credential check failed");
            return Err(AuthError::InvalidCredentials);
        };

        if !identity.enabled {
            return Err(AuthError::InactiveUser);
        }

        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::store::memory::MemoryStore;
    use uuid::Uuid;

    async fn verifier_with_user(enabled: bool) -> anyhow::Result<CredentialVerifier> {
        let hasher = Arc::new(BcryptHasher::new(4));
        let store = Arc::new(MemoryStore::new());
        store
            .insert_identity(Identity {
                id: Uuid::new_v4(),
                name: "Real".to_string(),
                email: "real@x.com".to_string(),
                password_hash: hasher.hash("correct-horse")?,
                enabled,
            })
            .await?;
        CredentialVerifier::new(store, hasher)
    }

    #[tokio::test]
    async fn accepts_matching_password_case_insensitive_email() -> anyhow::Result<()> {
        let verifier = verifier_with_user(true).await?;
        let identity = verifier.verify("  REAL@x.com ", "correct-horse").await?;
        assert_eq!(identity.email, "real@x.com");
        Ok(())
    }

    #[tokio::test]
    async fn unknown_email_and_wrong_password_match() -> anyhow::Result<()> {
        let verifier = verifier_with_user(true).await?;
        let unknown = verifier.verify("nonexistent@x.com", "anything").await;
        let wrong = verifier.verify("real@x.com", "wrongpassword").await;

        let (Err(unknown), Err(wrong)) = (unknown, wrong) else {
            anyhow::bail!("both attempts should fail");
        };
        assert_eq!(unknown.code(), wrong.code());
        assert_eq!(unknown.to_string(), wrong.to_string());
        assert!(matches!(unknown, AuthError::InvalidCredentials));
        Ok(())
    }

    #[tokio::test]
    async fn inactive_checked_after_password() -> anyhow::Result<()> {
        let verifier = verifier_with_user(false).await?;
        assert!(matches!(
            verifier.verify("real@x.com", "wrong").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            verifier.verify("real@x.com", "correct-horse").await,
            Err(AuthError::InactiveUser)
        ));
        Ok(())
    }
}
