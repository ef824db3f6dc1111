//! Command-line and environment configuration.
//!
//! Every service setting has a flag and an environment variable; flags win.
//! Parsed values are turned into typed configuration here so the binary only
//! wires things together.

use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum};
use murmur_core::{FailurePolicy, ModerationConfig};
use murmur_crypto::{
    CryptoError, DeploymentSecret, kdf::DEFAULT_ITERATIONS, keypair::DEFAULT_MODULUS_BITS,
};

use crate::{
    openai::{DEFAULT_ENDPOINT, DEFAULT_MODEL, OpenAiConfig},
    postmaster::PostmasterConfig,
};

/// Anonymous end-to-end encrypted messages with moderation
#[derive(Parser, Debug)]
#[command(name = "murmur")]
#[command(about = "Anonymous end-to-end encrypted messages with moderation")]
#[command(version)]
pub struct Cli {
    /// Service settings
    #[command(flatten)]
    pub service: ServiceArgs,

    /// Operation to run
    #[command(subcommand)]
    pub command: Command,
}

/// Settings shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct ServiceArgs {
    /// Database file
    #[arg(long, env = "MURMUR_DB", default_value = "murmur.redb")]
    pub db: PathBuf,

    /// Deployment secret for server key custody (64 hex characters)
    #[arg(long, env = "MURMUR_CUSTODY_SECRET", hide_env_values = true)]
    pub custody_secret: Option<String>,

    /// PBKDF2 iterations for new passphrase envelopes
    #[arg(long, env = "MURMUR_KDF_ITERATIONS", default_value_t = DEFAULT_ITERATIONS)]
    pub kdf_iterations: u32,

    /// RSA modulus size for new key pairs
    #[arg(long, env = "MURMUR_MODULUS_BITS", default_value_t = DEFAULT_MODULUS_BITS)]
    pub modulus_bits: usize,

    /// Content classifier
    #[arg(
        long,
        env = "MURMUR_CLASSIFIER",
        value_enum,
        default_value_t = ClassifierKind::Blocklist
    )]
    pub classifier: ClassifierKind,

    /// API key for the remote classifier
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Remote classifier model
    #[arg(long, env = "MURMUR_OPENAI_MODEL", default_value = DEFAULT_MODEL)]
    pub openai_model: String,

    /// Remote classifier endpoint
    #[arg(long, env = "MURMUR_OPENAI_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub openai_endpoint: String,

    /// Per-attempt moderation timeout in milliseconds
    #[arg(long, env = "MURMUR_MODERATION_TIMEOUT_MS", default_value_t = 10_000)]
    pub moderation_timeout_ms: u64,

    /// Retries after a transient classifier failure (0 or 1)
    #[arg(
        long,
        env = "MURMUR_MODERATION_RETRIES",
        default_value_t = 1,
        value_parser = clap::value_parser!(u8).range(0..=1)
    )]
    pub moderation_retries: u8,

    /// Admit messages when the classifier is unavailable
    #[arg(long, env = "MURMUR_FAIL_OPEN", default_value_t = false)]
    pub fail_open: bool,

    /// Directory holding client-side wrapped keys
    #[arg(long, env = "MURMUR_KEYSTORE", default_value = ".murmur-keys")]
    pub keystore: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Which classifier screens submissions.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierKind {
    /// Local word lists
    Blocklist,
    /// OpenAI-compatible chat completions
    Openai,
}

/// Subcommands of the `murmur` binary.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print a fresh deployment secret
    GenSecret,

    /// Register a new identity
    Register {
        /// Username (3-32 characters of a-z, 0-9, '_', '.', '-')
        username: String,

        /// Display name, defaults to the username
        #[arg(long)]
        display_name: Option<String>,

        #[command(flatten)]
        custody: CustodyArgs,
    },

    /// Print the active public key of a user
    PublicKey {
        /// Username to look up
        username: String,
    },

    /// Encrypt and submit a message
    Send {
        /// Recipient username
        to: String,

        /// Message text
        message: String,

        /// Sender username; anonymous when absent
        #[arg(long)]
        from: Option<String>,

        /// Submit ciphertext only, without screening text
        #[arg(long)]
        no_screening: bool,
    },

    /// Read received messages
    Inbox {
        /// Recipient username
        username: String,

        #[command(flatten)]
        custody: CustodyArgs,

        /// First log index to read
        #[arg(long, default_value_t = 0)]
        from: u64,

        /// Maximum messages to read
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// List messages sent by a user, newest first
    Sent {
        /// Sender username
        username: String,

        /// Maximum messages to list
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Replace the active key pair of a user
    RotateKey {
        /// Username
        username: String,

        #[command(flatten)]
        custody: CustodyArgs,
    },
}

/// Where the private key lives.
#[derive(Args, Debug, Clone)]
pub struct CustodyArgs {
    /// Passphrase protecting the client-held private key
    #[arg(
        long,
        env = "MURMUR_PASSPHRASE",
        hide_env_values = true,
        conflicts_with = "server_custody"
    )]
    pub passphrase: Option<String>,

    /// Keep the private key on the server under the deployment secret
    #[arg(long)]
    pub server_custody: bool,
}

impl ServiceArgs {
    /// Postmaster settings.
    pub fn postmaster_config(&self) -> PostmasterConfig {
        PostmasterConfig { modulus_bits: self.modulus_bits, kdf_iterations: self.kdf_iterations }
    }

    /// Moderation gate settings.
    pub fn moderation_config(&self) -> ModerationConfig {
        ModerationConfig {
            timeout: Duration::from_millis(self.moderation_timeout_ms),
            max_retries: self.moderation_retries,
            policy: if self.fail_open { FailurePolicy::FailOpen } else { FailurePolicy::FailClosed },
        }
    }

    /// Parsed deployment secret. `None` disables server custody.
    ///
    /// # Errors
    ///
    /// - `InvalidSecret`: not 64 hex characters
    pub fn deployment_secret(&self) -> Result<Option<DeploymentSecret>, CryptoError> {
        self.custody_secret.as_deref().map(DeploymentSecret::from_hex).transpose()
    }

    /// Remote classifier settings, if an API key is configured.
    pub fn openai_config(&self) -> Option<OpenAiConfig> {
        let api_key = self.openai_api_key.clone()?;

        Some(OpenAiConfig {
            api_key,
            model: self.openai_model.clone(),
            endpoint: self.openai_endpoint.clone(),
            request_timeout: Duration::from_millis(self.moderation_timeout_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("murmur").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_fail_closed() {
        let cli = parse(&["public-key", "alice"]);
        let moderation = cli.service.moderation_config();

        assert_eq!(moderation.policy, FailurePolicy::FailClosed);
        assert_eq!(moderation.max_retries, 1);
        assert_eq!(moderation.timeout, Duration::from_secs(10));
        assert_eq!(cli.service.classifier, ClassifierKind::Blocklist);
    }

    #[test]
    fn fail_open_flag() {
        let cli = parse(&["--fail-open", "gen-secret"]);
        assert_eq!(cli.service.moderation_config().policy, FailurePolicy::FailOpen);
    }

    #[test]
    fn retries_above_one_rejected() {
        let result = Cli::try_parse_from(["murmur", "--moderation-retries", "2", "gen-secret"]);
        assert!(result.is_err());
    }

    #[test]
    fn passphrase_conflicts_with_server_custody() {
        let result = Cli::try_parse_from([
            "murmur",
            "register",
            "alice",
            "--passphrase",
            "p1",
            "--server-custody",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn malformed_secret_is_an_error() {
        let cli = parse(&["--custody-secret", "abcd", "gen-secret"]);
        assert!(matches!(cli.service.deployment_secret(), Err(CryptoError::InvalidSecret(_))));
    }

    #[test]
    fn send_parses_positionals() {
        let cli = parse(&["send", "alice", "hello there", "--from", "bob"]);
        match cli.command {
            Command::Send { to, message, from, no_screening } => {
                assert_eq!(to, "alice");
                assert_eq!(message, "hello there");
                assert_eq!(from.as_deref(), Some("bob"));
                assert!(!no_screening);
            },
            other => panic!("unexpected command {other:?}"),
        }
    }
}
