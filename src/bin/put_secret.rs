//! Stores an org secret that connection configs reference as `{"secret": KEY}`.
//!
//! The value is read from stdin so it never appears in shell history.

use std::io::Read;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use repo_sync::{
    config::ConfigLoader,
    crypto::CryptoKey,
    db,
    migration::{Migrator, MigratorTrait},
    repositories::SecretRepository,
};
use zeroize::Zeroizing;

#[derive(Debug, Parser)]
#[command(name = "put-secret", about = "Encrypt and store an org secret")]
struct Args {
    /// Secret key referenced from connection configs
    key: String,

    /// Organization owning the secret
    #[arg(long, default_value_t = 1)]
    org_id: i32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    let key_bytes = config
        .crypto_key
        .clone()
        .context("REPO_SYNC_CRYPTO_KEY must be set to store secrets")?;
    let crypto_key = CryptoKey::new(key_bytes).context("initializing crypto key")?;

    let mut value = Zeroizing::new(String::new());
    std::io::stdin()
        .read_to_string(&mut value)
        .context("reading secret value from stdin")?;
    let trimmed = value.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        bail!("secret value is empty");
    }

    let db = db::init_pool(&config).await?;
    Migrator::up(&db, None)
        .await
        .context("applying database migrations")?;

    SecretRepository::new(Arc::new(db))
        .put(&crypto_key, args.org_id, &args.key, trimmed)
        .await
        .context("storing secret")?;

    println!("Stored secret '{}' for org {}", args.key, args.org_id);
    Ok(())
}
