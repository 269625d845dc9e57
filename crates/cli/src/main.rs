//! Operator CLI for the depot storage engine.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use depot_core::{ModuleConfig, StorageConfig};
use depot_storage::{DataStore, RequestContext, SaveOptions, StorageError};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

const DEFAULT_CONFIG_PATH: &str = "depot.toml";

#[derive(Parser)]
#[command(name = "depotctl")]
#[command(about = "Operator CLI for the depot storage engine")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    target: TargetArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct TargetArgs {
    /// Config file path
    #[arg(long, global = true, env = "DEPOT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Tenant to operate on (overrides config)
    #[arg(long, global = true)]
    tenant: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a local file
    Put {
        domain: String,
        path: String,
        file: PathBuf,
        /// Owner charged for the object
        #[arg(long)]
        owner: Option<Uuid>,
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Download an object to a file or stdout
    Get {
        domain: String,
        path: String,
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        length: Option<u64>,
    },
    /// Delete objects
    Rm {
        domain: String,
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Delete the files under a directory that match a wildcard pattern
    Purge {
        domain: String,
        dir: String,
        #[arg(long, default_value = "*")]
        pattern: String,
        #[arg(short, long, default_value_t = false)]
        recursive: bool,
        /// Owner refunded for the deleted bytes
        #[arg(long)]
        owner: Option<Uuid>,
    },
    /// List files or directories
    Ls {
        domain: String,
        #[arg(default_value = "")]
        dir: String,
        #[arg(long, default_value = "*")]
        pattern: String,
        #[arg(short, long, default_value_t = false)]
        recursive: bool,
        /// List directories instead of files
        #[arg(short, long, default_value_t = false)]
        dirs: bool,
    },
    /// Copy an object
    Cp {
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Move an object
    Mv {
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Show the size of a file or directory
    Du {
        domain: String,
        #[arg(default_value = "")]
        path: String,
    },
    /// Issue an access URL
    Url {
        domain: String,
        path: String,
        /// Lifetime in seconds (default: the domain's)
        #[arg(long)]
        expires: Option<u64>,
        /// Response header override, e.g. "Content-Disposition: attachment"
        #[arg(long = "header")]
        headers: Vec<String>,
        /// Issue through the CDN distribution
        #[arg(long, default_value_t = false)]
        cdn: bool,
        /// Issue for a plain-HTTP caller
        #[arg(long, default_value_t = false)]
        insecure: bool,
    },
    /// Append local files or stored objects to a remote tar archive
    Append {
        domain: String,
        archive: String,
        files: Vec<PathBuf>,
        /// Stored object in the same domain to append by reference
        #[arg(long = "object")]
        objects: Vec<String>,
    },
    /// Terminate every slot of a remote tar archive
    Finish { domain: String, archive: String },
}

#[derive(Args, Clone)]
struct TransferArgs {
    src_domain: String,
    src: String,
    dst_domain: String,
    dst: String,
    #[arg(long)]
    owner: Option<Uuid>,
}

/// Everything `depotctl` needs to open a store.
#[derive(Debug, Deserialize)]
struct CliConfig {
    #[serde(default)]
    tenant: u64,
    storage: StorageConfig,
    module: ModuleConfig,
    #[serde(default = "default_archive_slots")]
    archive_slots: u32,
}

fn default_archive_slots() -> u32 {
    depot_storage::store::DEFAULT_ARCHIVE_SLOTS
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so `get` can stream to stdout.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Cli { target, command } = Cli::parse();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling in-flight transfers");
                cancel.cancel();
            }
        }
    });

    let config = load_config(&target.config)?;
    let store = open_store(&config, target.tenant, cancel.clone()).await?;

    match command {
        Commands::Put {
            domain,
            path,
            file,
            owner,
            content_type,
        } => handle_put(&store, &domain, &path, &file, owner, content_type).await,
        Commands::Get {
            domain,
            path,
            output,
            offset,
            length,
        } => handle_get(&store, &domain, &path, output.as_deref(), offset, length).await,
        Commands::Rm { domain, paths } => handle_rm(&store, &domain, &paths).await,
        Commands::Purge {
            domain,
            dir,
            pattern,
            recursive,
            owner,
        } => {
            let deleted = store
                .delete_files(&domain, &dir, &pattern, recursive, owner.unwrap_or_default())
                .await
                .with_context(|| format!("failed to purge {domain}/{dir}"))?;
            println!("Deleted {deleted} file(s)");
            Ok(())
        }
        Commands::Ls {
            domain,
            dir,
            pattern,
            recursive,
            dirs,
        } => handle_ls(&store, &domain, &dir, &pattern, recursive, dirs).await,
        Commands::Cp { transfer } => handle_transfer(&store, &transfer, false).await,
        Commands::Mv { transfer } => handle_transfer(&store, &transfer, true).await,
        Commands::Du { domain, path } => handle_du(&store, &domain, &path).await,
        Commands::Url {
            domain,
            path,
            expires,
            headers,
            cdn,
            insecure,
        } => {
            let expiry = expires.map(Duration::from_secs).unwrap_or(Duration::ZERO);
            let request = insecure.then(RequestContext::insecure);
            let url = if cdn {
                store
                    .get_cdn_presigned_uri(&domain, &path, expiry, &headers, request.as_ref())
                    .await
            } else {
                store
                    .get_presigned_uri(&domain, &path, expiry, &headers, request.as_ref())
                    .await
            }
            .with_context(|| format!("failed to issue URL for {domain}/{path}"))?;
            println!("{url}");
            Ok(())
        }
        Commands::Append {
            domain,
            archive,
            files,
            objects,
        } => handle_append(&store, &domain, &archive, &files, &objects, &cancel).await,
        Commands::Finish { domain, archive } => {
            let engine = store.archive_engine(&domain);
            let keys = engine
                .finish(&store.resolve(&domain, &archive), &cancel)
                .await
                .with_context(|| format!("failed to finish archive {archive}"))?;
            for key in keys {
                println!("{key}");
            }
            Ok(())
        }
    }
}

/// Load configuration from `path` (optional) merged with `DEPOT_*` variables.
fn load_config(path: &Path) -> Result<CliConfig> {
    let mut figment = Figment::new();

    if path.exists() {
        tracing::debug!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path.display());
    }

    let config: CliConfig = figment
        .merge(Env::prefixed("DEPOT_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    config
        .storage
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid storage configuration")?;

    Ok(config)
}

async fn open_store(
    config: &CliConfig,
    tenant: Option<u64>,
    cancel: CancellationToken,
) -> Result<DataStore> {
    let tenant = tenant.unwrap_or(config.tenant);
    let store = depot_storage::open(&config.storage, &config.module, tenant, None)
        .await
        .context("failed to open storage")?
        .with_archive_slots(config.archive_slots)
        .with_cancellation(cancel);
    tracing::debug!(tenant, module = %config.module.name, "Storage opened");
    Ok(store)
}

async fn handle_put(
    store: &DataStore,
    domain: &str,
    path: &str,
    file: &Path,
    owner: Option<Uuid>,
    content_type: Option<String>,
) -> Result<()> {
    let handle = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("failed to open {}", file.display()))?;
    let size = handle.metadata().await?.len();
    let stream = ReaderStream::new(handle)
        .map_err(StorageError::from)
        .boxed();

    let options = SaveOptions {
        content_type,
        ..SaveOptions::default()
    };
    let url = store
        .save_stream(domain, path, owner.unwrap_or_default(), stream, size, &options)
        .await
        .with_context(|| format!("failed to upload {}", file.display()))?;

    tracing::info!(domain, path, size = %format_bytes(size), "Uploaded");
    println!("{url}");
    Ok(())
}

async fn handle_get(
    store: &DataStore,
    domain: &str,
    path: &str,
    output: Option<&Path>,
    offset: u64,
    length: Option<u64>,
) -> Result<()> {
    let mut stream = store
        .get_read_stream(domain, path, offset, length)
        .await
        .with_context(|| format!("failed to read {domain}/{path}"))?;

    let mut writer: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk: Bytes = chunk?;
        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    writer.flush().await?;

    tracing::debug!(domain, path, written, "Downloaded");
    Ok(())
}

async fn handle_rm(store: &DataStore, domain: &str, paths: &[String]) -> Result<()> {
    if let [path] = paths {
        store
            .delete(domain, path)
            .await
            .with_context(|| format!("failed to delete {domain}/{path}"))?;
        return Ok(());
    }

    let deleted = store
        .delete_paths(domain, paths)
        .await
        .with_context(|| format!("failed to delete from {domain}"))?;
    println!("Deleted {deleted} of {} path(s)", paths.len());
    Ok(())
}

async fn handle_ls(
    store: &DataStore,
    domain: &str,
    dir: &str,
    pattern: &str,
    recursive: bool,
    dirs: bool,
) -> Result<()> {
    let mut entries = if dirs {
        store.list_directories_relative(domain, dir, recursive)
    } else {
        store.list_files_relative(domain, dir, pattern, recursive)
    };

    while let Some(entry) = entries.next().await {
        println!("{}", entry.context("listing failed")?);
    }
    Ok(())
}

async fn handle_transfer(store: &DataStore, transfer: &TransferArgs, remove_source: bool) -> Result<()> {
    let TransferArgs {
        src_domain,
        src,
        dst_domain,
        dst,
        owner,
    } = transfer;
    let owner = owner.unwrap_or_default();

    let url = if remove_source {
        store
            .move_object(src_domain, src, dst_domain, dst, owner)
            .await
    } else {
        store
            .copy_object(src_domain, src, dst_domain, dst, owner)
            .await
    }
    .with_context(|| format!("failed to transfer {src_domain}/{src} to {dst_domain}/{dst}"))?;

    println!("{url}");
    Ok(())
}

async fn handle_du(store: &DataStore, domain: &str, path: &str) -> Result<()> {
    let size = if !path.is_empty() && store.is_file(domain, path).await? {
        store.get_file_size(domain, path).await?
    } else {
        store
            .get_directory_size(domain, path)
            .await
            .with_context(|| format!("failed to size {domain}/{path}"))?
    };
    println!("{}\t{}", format_bytes(size), if path.is_empty() { domain } else { path });
    Ok(())
}

async fn handle_append(
    store: &DataStore,
    domain: &str,
    archive: &str,
    files: &[PathBuf],
    objects: &[String],
    cancel: &CancellationToken,
) -> Result<()> {
    if files.is_empty() && objects.is_empty() {
        anyhow::bail!("nothing to append; pass files or --object paths");
    }

    let engine = store.archive_engine(domain);
    let base = store.resolve(domain, archive);

    for file in files {
        let name = member_name(file)?;
        let data = tokio::fs::read(file)
            .await
            .with_context(|| format!("failed to read {}", file.display()))?;
        let outcome = engine
            .append_member(&base, &name, Bytes::from(data), cancel)
            .await
            .with_context(|| format!("failed to append {}", file.display()))?;
        tracing::info!(member = %name, key = %outcome.key, offset = outcome.offset, "Appended");
    }

    for object in objects {
        let name = object.rsplit('/').next().unwrap_or(object);
        let outcome = engine
            .append_object(&base, name, &store.resolve(domain, object), cancel)
            .await
            .with_context(|| format!("failed to append object {object}"))?;
        tracing::info!(member = %name, key = %outcome.key, offset = outcome.offset, "Appended");
    }

    Ok(())
}

/// Archive member name for a local file: its file name.
fn member_name(file: &Path) -> Result<String> {
    file.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("{} has no usable file name", file.display()))
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    const TB: u64 = 1024 * GB;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
