use crate::{
    cli::actions::{server::Args, Action},
    identity::{authorize::PermissionSource, token::JwtSettings},
};
use anyhow::{anyhow, Context, Result};
use secrecy::SecretString;
use std::time::Duration;

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;

    let key = matches
        .get_one::<String>("jwt-key")
        .cloned()
        .context("missing required argument: --jwt-key")?;

    let mut jwt = JwtSettings::new(SecretString::from(key))
        .with_blacklist(matches.get_flag("jwt-enable-blacklist"));
    if let Some(issuer) = matches.get_one::<String>("jwt-issuer") {
        jwt = jwt.with_issuer(issuer.clone());
    }
    if let Some(audience) = matches.get_one::<String>("jwt-audience") {
        jwt = jwt.with_audience(audience.clone());
    }
    if let Some(hours) = matches.get_one::<u32>("jwt-expiry-hours") {
        jwt = jwt.with_expiry_hours(*hours);
    }
    if let Some(days) = matches.get_one::<u32>("refresh-token-expiry-days") {
        jwt = jwt.with_refresh_token_expiry_days(*days);
    }

    let permission_source = matches
        .get_one::<String>("permission-source")
        .map_or(Ok(PermissionSource::default()), |value| value.parse())
        .map_err(|err: String| anyhow!(err))?;

    let storage_timeout = Duration::from_secs(
        matches
            .get_one::<u64>("storage-timeout-seconds")
            .copied()
            .unwrap_or(10),
    );

    Ok(Action::Server(Args {
        port,
        dsn,
        jwt,
        permission_source,
        storage_timeout,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn builds_server_action() -> Result<()> {
        temp_env::with_vars(
            [
                ("UMBRAL_PORT", None::<&str>),
                ("UMBRAL_JWT_ISSUER", None),
                ("UMBRAL_JWT_ENABLE_BLACKLIST", None),
                ("UMBRAL_PERMISSION_SOURCE", None),
                ("UMBRAL_STORAGE_TIMEOUT_SECONDS", None),
            ],
            || {
                let matches = commands::new().get_matches_from(vec![
                    "umbral",
                    "--dsn",
                    "memory://",
                    "--jwt-key",
                    KEY,
                    "--jwt-issuer",
                    "https://id.example.com",
                    "--jwt-expiry-hours",
                    "2",
                    "--jwt-enable-blacklist",
                    "--permission-source",
                    "token",
                    "--storage-timeout-seconds",
                    "5",
                ]);

                let Action::Server(args) = handler(&matches)?;
                assert_eq!(args.port, 8080);
                assert_eq!(args.dsn, "memory://");
                assert_eq!(args.jwt.issuer(), "https://id.example.com");
                assert_eq!(args.jwt.expiry_hours(), 2);
                assert!(args.jwt.blacklist_enabled());
                assert_eq!(args.permission_source, PermissionSource::Token);
                assert_eq!(args.storage_timeout, Duration::from_secs(5));
                Ok(())
            },
        )
    }
}
