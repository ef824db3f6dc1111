//! Murmur command-line client and service.
//!
//! # Usage
//!
//! ```bash
//! # One-time: create a deployment secret for server key custody
//! export MURMUR_CUSTODY_SECRET=$(murmur gen-secret)
//!
//! # Register, keeping the private key client-side under a passphrase
//! murmur register alice --passphrase p1
//!
//! # Send an anonymous message and read it back
//! murmur send alice "thanks for the talk"
//! murmur inbox alice --passphrase p1
//! ```

// Command results go to stdout; logs go to stderr.
#![allow(clippy::print_stdout)]

use std::{error::Error, sync::Arc};

use clap::Parser;
use murmur_core::{
    BlocklistClassifier, Classifier, Environment, IdentityId, ModerationGate, Submission,
    identity::normalize_username, open_all,
};
use murmur_crypto::{DeploymentSecret, KeyCustodyService, cipher, encoding};
use murmur_server::{
    CustodyChoice, Delivery, FileKeyStore, OpenAiClassifier, Postmaster, RedbStorage,
    Registration, SystemEnv,
    config::{ClassifierKind, Cli, Command, CustodyArgs, ServiceArgs},
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

type Service = Postmaster<SystemEnv, RedbStorage>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.service.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Needs no database.
    if let Command::GenSecret = cli.command {
        print_secret();
        return Ok(());
    }

    let postmaster = build_postmaster(&cli.service)?;
    let keystore = FileKeyStore::open(&cli.service.keystore)?;

    run(cli.command, &postmaster, &keystore).await
}

fn build_postmaster(service: &ServiceArgs) -> Result<Service, Box<dyn Error>> {
    let storage = RedbStorage::open(&service.db)?;

    let classifier: Arc<dyn Classifier> = match service.classifier {
        ClassifierKind::Blocklist => Arc::new(BlocklistClassifier::new()),
        ClassifierKind::Openai => {
            let config = service
                .openai_config()
                .ok_or("OPENAI_API_KEY is required for the openai classifier")?;
            Arc::new(OpenAiClassifier::new(config)?)
        },
    };

    let moderation = service.moderation_config();
    tracing::debug!(
        classifier = ?service.classifier,
        policy = ?moderation.policy,
        "moderation configured"
    );

    let gate = ModerationGate::new(classifier, moderation);
    let mut postmaster =
        Postmaster::new(SystemEnv::new(), storage, gate, service.postmaster_config())?;

    match service.deployment_secret()? {
        Some(secret) => postmaster = postmaster.with_custody(KeyCustodyService::new(&secret)?),
        None => tracing::debug!("no deployment secret, server custody disabled"),
    }

    Ok(postmaster)
}

async fn run(
    command: Command,
    postmaster: &Service,
    keystore: &FileKeyStore,
) -> Result<(), Box<dyn Error>> {
    match command {
        Command::GenSecret => print_secret(),

        Command::Register { username, display_name, custody } => {
            let receipt = postmaster
                .register(Registration {
                    display_name: display_name.unwrap_or_else(|| username.clone()),
                    username,
                    custody: custody_choice(custody)?,
                })
                .await?;

            if let Some(wrapped) = &receipt.wrapped_key {
                keystore.save(&receipt.username, receipt.identity_id, receipt.generation, wrapped)?;
            }

            println!("registered {} ({})", receipt.username, receipt.identity_id);
            println!("fingerprint {}", receipt.fingerprint);
        },

        Command::PublicKey { username } => {
            let entry = postmaster.public_key(&username)?;
            println!("{}", entry.public_key.to_base64());
            println!("generation {} fingerprint {}", entry.generation, entry.fingerprint);
        },

        Command::Send { to, message, from, no_screening } => {
            let recipient = postmaster.public_key(&to)?;
            let sender = from.map(|name| identity_of(postmaster, &name)).transpose()?;

            let ciphertext = cipher::encrypt(
                message.as_bytes(),
                &recipient.public_key,
                &mut SystemEnv::new().rng(),
            )?;

            let submission = Submission {
                recipient: to,
                ciphertext: encoding::encode(&ciphertext),
                key_generation: recipient.generation,
                screening_text: if no_screening { None } else { Some(message) },
                sender,
            };

            match postmaster.submit(submission).await? {
                Delivery::Accepted { message_id } => {
                    println!("delivered as #{}", message_id.index);
                },
                Delivery::Rejected { reason } => return Err(reason.to_string().into()),
            }
        },

        Command::Inbox { username, custody, from, limit } => {
            let identity = identity_of(postmaster, &username)?;

            let keyring = match custody_choice(custody)? {
                CustodyChoice::Server => postmaster.unlock_custodied(identity)?,
                CustodyChoice::ClientPassphrase(passphrase) => {
                    let (stored, keyring) =
                        keystore.unlock(&normalize_username(&username)?, &passphrase)?;
                    if stored != identity {
                        return Err(format!("key store entry for {username} is stale").into());
                    }
                    keyring
                },
            };

            let messages = postmaster.inbox(identity, from, limit)?;
            for opened in open_all(&messages, &keyring) {
                let sender = opened.sender.map_or("anonymous".to_string(), |id| id.to_string());
                match opened.body {
                    Ok(text) => println!("#{} from {sender}: {text}", opened.id.index),
                    Err(failure) => println!("#{} from {sender}: <{failure:?}>", opened.id.index),
                }
            }
        },

        Command::Sent { username, limit } => {
            let identity = identity_of(postmaster, &username)?;

            for stored in postmaster.sent(identity, limit)? {
                println!(
                    "to {} #{} at {}",
                    stored.id.recipient, stored.id.index, stored.message.created_at_secs
                );
            }
        },

        Command::RotateKey { username, custody } => {
            let identity = identity_of(postmaster, &username)?;
            let receipt = postmaster.rotate_key(identity, custody_choice(custody)?).await?;

            if let Some(wrapped) = &receipt.wrapped_key {
                keystore.save(&receipt.username, receipt.identity_id, receipt.generation, wrapped)?;
            }

            println!("rotated {} to generation {}", receipt.username, receipt.generation);
            println!("fingerprint {}", receipt.fingerprint);
        },
    }

    Ok(())
}

fn print_secret() {
    let secret = DeploymentSecret::generate(&mut SystemEnv::new().rng());
    println!("{}", secret.to_hex());
}

fn identity_of(postmaster: &Service, username: &str) -> Result<IdentityId, Box<dyn Error>> {
    Ok(postmaster.public_key(username)?.identity_id)
}

fn custody_choice(args: CustodyArgs) -> Result<CustodyChoice, Box<dyn Error>> {
    match (args.passphrase, args.server_custody) {
        (_, true) => Ok(CustodyChoice::Server),
        (Some(passphrase), false) => Ok(CustodyChoice::ClientPassphrase(passphrase)),
        (None, false) => Err("either --passphrase or --server-custody is required".into()),
    }
}
