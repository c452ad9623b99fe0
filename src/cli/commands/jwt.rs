use clap::{Arg, ArgAction, Command};

use crate::identity::token::{DEFAULT_AUDIENCE, DEFAULT_ISSUER};

pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("jwt-key")
                .long("jwt-key")
                .help("HMAC-SHA256 signing key, at least 32 bytes")
                .env("UMBRAL_JWT_KEY")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new("jwt-issuer")
                .long("jwt-issuer")
                .help("Issuer written to and required from access tokens")
                .default_value(DEFAULT_ISSUER)
                .env("UMBRAL_JWT_ISSUER"),
        )
        .arg(
            Arg::new("jwt-audience")
                .long("jwt-audience")
                .help("Audience written to and required from access tokens")
                .default_value(DEFAULT_AUDIENCE)
                .env("UMBRAL_JWT_AUDIENCE"),
        )
        .arg(
            Arg::new("jwt-expiry-hours")
                .long("jwt-expiry-hours")
                .help("Access token lifetime in hours")
                .default_value("1")
                .env("UMBRAL_JWT_EXPIRY_HOURS")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("refresh-token-expiry-days")
                .long("refresh-token-expiry-days")
                .help("Web session lifetime in days (mobile sessions last 60 days)")
                .default_value("30")
                .env("UMBRAL_REFRESH_TOKEN_EXPIRY_DAYS")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("jwt-enable-blacklist")
                .long("jwt-enable-blacklist")
                .help("Reject access tokens of logged out sessions until they expire")
                .env("UMBRAL_JWT_ENABLE_BLACKLIST")
                .action(ArgAction::SetTrue),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn defaults_apply() {
        temp_env::with_vars(
            [
                ("UMBRAL_JWT_ISSUER", None::<&str>),
                ("UMBRAL_JWT_AUDIENCE", None),
                ("UMBRAL_JWT_EXPIRY_HOURS", None),
                ("UMBRAL_REFRESH_TOKEN_EXPIRY_DAYS", None),
                ("UMBRAL_JWT_ENABLE_BLACKLIST", None),
            ],
            || {
                let matches = with_args(Command::new("test"))
                    .get_matches_from(vec!["test", "--jwt-key", KEY]);
                assert_eq!(
                    matches.get_one::<String>("jwt-issuer").cloned(),
                    Some(DEFAULT_ISSUER.to_string())
                );
                assert_eq!(
                    matches.get_one::<String>("jwt-audience").cloned(),
                    Some(DEFAULT_AUDIENCE.to_string())
                );
                assert_eq!(matches.get_one::<u32>("jwt-expiry-hours").copied(), Some(1));
                assert_eq!(
                    matches.get_one::<u32>("refresh-token-expiry-days").copied(),
                    Some(30)
                );
                assert!(!matches.get_flag("jwt-enable-blacklist"));
            },
        );
    }

    #[test]
    fn env_overrides() {
        temp_env::with_vars(
            [
                ("UMBRAL_JWT_KEY", Some(KEY)),
                ("UMBRAL_JWT_ISSUER", Some("https://id.example.com")),
                ("UMBRAL_JWT_EXPIRY_HOURS", Some("4")),
                ("UMBRAL_REFRESH_TOKEN_EXPIRY_DAYS", Some("7")),
                ("UMBRAL_JWT_ENABLE_BLACKLIST", Some("true")),
            ],
            || {
                let matches = with_args(Command::new("test")).get_matches_from(vec!["test"]);
                assert_eq!(
                    matches.get_one::<String>("jwt-key").cloned(),
                    Some(KEY.to_string())
                );
                assert_eq!(
                    matches.get_one::<String>("jwt-issuer").cloned(),
                    Some("https://id.example.com".to_string())
                );
                assert_eq!(matches.get_one::<u32>("jwt-expiry-hours").copied(), Some(4));
                assert_eq!(
                    matches.get_one::<u32>("refresh-token-expiry-days").copied(),
                    Some(7)
                );
                assert!(matches.get_flag("jwt-enable-blacklist"));
            },
        );
    }
}
