//! deck-sync - command-line driver for the document sync core
//!
//! Configuration comes from the environment (or a `.env` file):
//! - `DECK_SYNC_BASE_URL`, `DECK_SYNC_CLIENT_ID`, `DECK_SYNC_SECRET_HASH`, `DECK_SYNC_ENV`
//! - `DECK_SYNC_REFRESH_TOKEN` to sign in
//! - `DECK_SYNC_CACHE_PATH` for the local record cache

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

use deck_sync::asset::fingerprint_for;
use deck_sync::sync::{AccessToken, ListOptions, UploadProgress};
use deck_sync::{
    AssetReference, ClientConfig, CollectionType, Fingerprint, PropertyKey, Record, RecordStore,
    StorageConfig, SyncClient,
};

#[derive(Parser, Debug)]
#[command(name = "deck-sync", version, about = "Sync documents with the remote store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Debug)]
enum Command {
    /// List the records of a collection and refresh the local cache
    List {
        /// Collection name
        #[arg(default_value = "pagePresentation")]
        collection: String,
        /// Include trashed records
        #[arg(long)]
        trashed: bool,
    },

    /// Print the content fingerprint of a file
    Fingerprint {
        /// File to fingerprint
        file: PathBuf,
    },

    /// Create a record for a file and upload its content
    Upload {
        /// Collection for the new record
        collection: String,
        /// File to upload
        file: PathBuf,
    },

    /// Permanently remove trashed records
    Expunge {
        /// Record ids
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deck_sync=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    match cli.command {
        Command::Fingerprint { file } => {
            let data = read_file(&file)?;
            println!("{}", fingerprint_for(&data, &file_name(&file)));
        }
        Command::List {
            collection,
            trashed,
        } => {
            let client = connect().await?;
            let store = RecordStore::open(StorageConfig::from_env())?;
            let options = ListOptions {
                include_trashed: trashed,
                ..Default::default()
            };

            let mut records = client
                .list_records(CollectionType::from(collection), options)
                .await?;
            client.resolve_download_urls(&mut records).await;
            let stats = store.apply_server_records(&records)?;
            info!(stored = stats.stored, removed = stats.removed, "Updated local cache");

            for record in &records {
                let title: String = record.get_property_or(&PropertyKey::Title, String::new());
                let marker = if record.is_trashed() { " (trashed)" } else { "" };
                println!("{}\t{}{}", record.id(), title, marker);
            }
        }
        Command::Upload { collection, file } => {
            let client = connect().await?;
            let store = RecordStore::open(StorageConfig::from_env())?;
            let data = Bytes::from(read_file(&file)?);
            let name = file_name(&file);

            let fingerprint = store.put_content(&data, &name)?;
            let mut record = Record::new(CollectionType::from(collection), None);
            record.set_property(PropertyKey::Title, name.as_str());
            record.attach_asset(AssetReference::pending(fingerprint.clone()), "content");
            store.queue_pending(&record)?;

            let blobs = HashMap::from([(fingerprint, data)]);
            let progress = |fingerprint: &Fingerprint, update: UploadProgress| {
                info!(%fingerprint, sent = update.bytes_sent, total = update.total_bytes, "Upload progress");
            };
            client
                .create_record_with_assets(&mut record, &blobs, Some(&progress), None)
                .await?;

            store.clear_pending(record.id())?;
            store.save_record(&record)?;
            store.flush()?;
            println!("{}", record.id());
        }
        Command::Expunge { ids } => {
            let client = connect().await?;
            client.expunge_records(&ids).await?;
            println!("Expunged {} record(s)", ids.len());
        }
    }
    Ok(())
}

/// Build a client from the environment and sign in with the stored refresh token
async fn connect() -> Result<SyncClient> {
    let config = ClientConfig::from_env()?;
    let client = SyncClient::with_reqwest(config)?;

    let refresh_token =
        std::env::var("DECK_SYNC_REFRESH_TOKEN").context("DECK_SYNC_REFRESH_TOKEN is not set")?;
    client
        .tokens()
        .sign_in_with(AccessToken::new(String::new(), refresh_token));
    client
        .tokens()
        .refresh()
        .await
        .context("Failed to sign in with the refresh token")?;

    info!(
        "deck-sync v{} connected to {}",
        env!("CARGO_PKG_VERSION"),
        client.config().base_url
    );
    Ok(client)
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
