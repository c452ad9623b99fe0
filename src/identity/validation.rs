//! Input rules checked before any storage access.

use regex::Regex;

use super::error::{AuthError, FieldError};

/// Normalize an email for lookup/uniqueness checks.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
#[must_use]
pub fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

/// # Errors
/// [`AuthError::Validation`] listing every failed field.
pub fn validate_login(email: &str, password: &str) -> Result<(), AuthError> {
    let mut errors = Vec::new();
    let email = normalize_email(email);
    if email.is_empty() {
        errors.push(FieldError::new("Email", "Email is required"));
    } else if !valid_email(&email) {
        errors.push(FieldError::new("Email", "Email format is invalid"));
    }
    if password.is_empty() {
        errors.push(FieldError::new("Password", "Password is required"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(AuthError::Validation(errors))
    }
}

/// # Errors
/// [`AuthError::Validation`] if the token is blank.
pub fn validate_refresh_token(token: &str) -> Result<(), AuthError> {
    if token.trim().is_empty() {
        return Err(AuthError::Validation(vec![FieldError::new(
            "RefreshToken",
            "Refresh token is required",
        )]));
    }
    Ok(())
}
