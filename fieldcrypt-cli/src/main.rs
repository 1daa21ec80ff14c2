//! `fieldcrypt` CLI tool for key management and explicit encryption.

#![warn(clippy::pedantic, clippy::nursery)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::Engine as _;
use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Uuid};
use clap::{Args, Parser, Subcommand};
use fieldcrypt::kdf::generate_key_material;
use fieldcrypt::options::{KmsProvidersConfig, LocalKmsConfig};
use fieldcrypt::prelude::*;
use fieldcrypt_key_file::FileKeyVault;
use fieldcrypt_kms_aws::AwsKmsProvider;
use secrecy::{ExposeSecret, SecretString};
use tracing_subscriber::EnvFilter;

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

#[derive(Parser)]
#[command(name = "fieldcrypt")]
#[command(about = "fieldcrypt key management and explicit encryption CLI", long_about = None)]
struct Cli {
    /// Base64 local master key
    #[arg(long, global = true, env = "FIELDCRYPT_LOCAL_MASTER_KEY", hide_env_values = true)]
    master_key: Option<String>,

    /// File holding the base64 local master key, preferred over `--master-key`
    #[arg(long, global = true)]
    master_key_file: Option<PathBuf>,

    /// JSON file with KMS provider credentials
    #[arg(long, global = true)]
    kms_providers: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a fresh base64 local master key
    Keygen,
    /// Create a data key in a key directory
    CreateKey {
        /// Key directory
        #[arg(long)]
        vault: PathBuf,
        /// Alternate name of the key (repeatable)
        #[arg(long = "alt-name")]
        alt_names: Vec<String>,
        /// KMS provider wrapping the key
        #[arg(long, default_value = "local")]
        provider: String,
        /// AWS region of the master key
        #[arg(long, requires = "aws_key")]
        aws_region: Option<String>,
        /// AWS KMS key ARN or alias
        #[arg(long, requires = "aws_region")]
        aws_key: Option<String>,
        /// AWS KMS endpoint override
        #[arg(long)]
        aws_endpoint: Option<String>,
    },
    /// Encrypt one extended JSON value
    Encrypt {
        /// Key directory
        #[arg(long)]
        vault: PathBuf,
        #[command(flatten)]
        key: KeyArgs,
        /// `deterministic` or `random`
        #[arg(long, default_value = "deterministic")]
        algorithm: String,
        /// Value as extended JSON, e.g. '"000"' or '{"$numberLong": "7"}'
        value: String,
    },
    /// Decrypt a base64 encrypted value
    Decrypt {
        /// Key directory
        #[arg(long)]
        vault: PathBuf,
        /// Base64 payload printed by `encrypt`
        payload: String,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct KeyArgs {
    /// Data key id
    #[arg(long)]
    key_id: Option<String>,
    /// Data key alternate name
    #[arg(long)]
    alt_name: Option<String>,
}

impl KeyArgs {
    fn encrypt_key(&self) -> Result<EncryptKey> {
        match (&self.key_id, &self.alt_name) {
            (Some(id), _) => Ok(EncryptKey::Id(Uuid::parse_str(id).with_context(|| format!("invalid key id: {id}"))?)),
            (None, Some(name)) => Ok(EncryptKey::AltName(name.clone())),
            (None, None) => bail!("either --key-id or --alt-name is required"),
        }
    }
}

impl Cli {
    fn local_master_key(&self) -> Result<Option<LocalKmsConfig>> {
        let key = match (&self.master_key_file, &self.master_key) {
            (Some(path), _) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read master key file {}", path.display()))?,
            (None, Some(key)) => key.clone(),
            (None, None) => return Ok(None),
        };
        Ok(Some(LocalKmsConfig { key: SecretString::new(key) }))
    }

    fn kms_providers(&self) -> Result<KmsProviders> {
        let config: KmsProvidersConfig = match &self.kms_providers {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_json::from_str(&text).with_context(|| format!("invalid KMS providers file {}", path.display()))?
            }
            None => KmsProvidersConfig::default(),
        };

        let mut providers = config.local_providers()?;
        if let Some(local) = self.local_master_key()? {
            providers = providers.with_local(local.master_key()?)?;
        }
        if let Some(aws) = &config.aws {
            providers.register(Arc::new(AwsKmsProvider::with_credentials(aws)));
        }

        if providers.is_empty() {
            bail!("no KMS provider configured: pass --master-key-file, set FIELDCRYPT_LOCAL_MASTER_KEY or use --kms-providers");
        }
        Ok(providers)
    }

    fn client_encryption(&self, key_dir: &Path, create: bool) -> Result<ClientEncryption> {
        let opened = if create { FileKeyVault::init(key_dir) } else { FileKeyVault::new(key_dir) };
        let vault = opened.with_context(|| format!("cannot open key directory {}", key_dir.display()))?;
        tracing::debug!(key_dir = %vault.key_dir().display(), "opened key directory");
        Ok(ClientEncryption::with_backend(Arc::new(vault), self.kms_providers()?))
    }
}

fn master_key(
    provider: &str,
    region: Option<String>,
    key: Option<String>,
    endpoint: Option<String>,
) -> Option<MasterKey> {
    match (provider, region, key) {
        ("aws", Some(region), Some(key)) => Some(MasterKey::Aws { region, key, endpoint }),
        _ => None,
    }
}

fn parse_value(value: &str) -> Result<Bson> {
    let json: serde_json::Value = serde_json::from_str(value).context("value is not valid JSON")?;
    Bson::try_from(json).context("value is not valid extended JSON")
}

fn decode_payload(payload: &str) -> Result<Bson> {
    let bytes = BASE64.decode(payload.trim()).context("payload is not base64")?;
    Ok(Bson::Binary(Binary { subtype: BinarySubtype::Encrypted, bytes }))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Keygen => {
            println!("{}", BASE64.encode(generate_key_material().expose_secret()));
        }
        Commands::CreateKey { vault, alt_names, provider, aws_region, aws_key, aws_endpoint } => {
            let encryption = cli.client_encryption(vault, true)?;
            let master_key = master_key(provider, aws_region.clone(), aws_key.clone(), aws_endpoint.clone());
            let id = encryption
                .create_data_key(provider, master_key, alt_names.clone())
                .await
                .context("failed to create data key")?;
            println!("{id}");
        }
        Commands::Encrypt { vault, key, algorithm, value } => {
            let encryption = cli.client_encryption(vault, false)?;
            let algorithm: Algorithm = algorithm.parse()?;
            let encrypted = encryption
                .encrypt(parse_value(value)?, algorithm, key.encrypt_key()?)
                .await
                .context("encryption failed")?;
            println!("{}", BASE64.encode(&encrypted.bytes));
        }
        Commands::Decrypt { vault, payload } => {
            let encryption = cli.client_encryption(vault, false)?;
            let value = encryption.decrypt(&decode_payload(payload)?).await.context("decryption failed")?;
            println!("{}", value.into_relaxed_extjson());
        }
    }

    Ok(())
}
