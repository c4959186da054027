use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use yaolist_transfer::config;
use yaolist_transfer::storage::{Lister, ProgressCallback, StorageManager};
use yaolist_transfer::transfer::UploadSource;
use yaolist_transfer::utils::percent;

#[derive(Debug, Parser)]
#[command(name = "yaolist-transfer", version = env!("CARGO_PKG_VERSION"), about = "Chunked resumable transfers", long_about = None)]
struct Cli {
    /// Transfer settings, created with defaults when missing / 传输配置文件
    #[arg(long, default_value = "transfer.json")]
    config: PathBuf,
    /// Local chunk store directory / 本地分片存储目录
    #[arg(long, default_value = "data/store")]
    root: PathBuf,
    /// Use an HTTP PUT/GET object server instead of the local store
    #[arg(long, value_name = "URL")]
    http: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload a local file / 上传
    Put { local: PathBuf, remote: String },
    /// Download a file or a byte range of it / 下载
    Get {
        remote: String,
        local: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        length: Option<u64>,
    },
    /// List a directory / 列目录
    Ls {
        #[arg(default_value = "/")]
        remote: String,
    },
    /// Print build information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "yaolist_transfer=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Command::Version = cli.command {
        println!(
            "yaolist-transfer {} ({} build, {})",
            env!("CARGO_PKG_VERSION"),
            env!("BUILD_PROFILE"),
            env!("BUILD_TIME")
        );
        return Ok(());
    }

    // Load configuration / 加载配置
    let transfer_config = config::load_config(&cli.config).map_err(|e| anyhow!(e))?;

    let storage_manager = StorageManager::new();
    yaolist_transfer::register_storage_drivers(&storage_manager).await?;
    let driver = match &cli.http {
        Some(address) => {
            storage_manager
                .create_driver(
                    "http",
                    "http_chunked",
                    serde_json::json!({ "address": address, "transfer": transfer_config }),
                )
                .await?
        }
        None => {
            storage_manager
                .create_driver(
                    "local",
                    "local_chunked",
                    serde_json::json!({ "root": cli.root, "transfer": transfer_config }),
                )
                .await?
        }
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling transfer");
            ctrl_c.cancel();
        }
    });

    match cli.command {
        Command::Put { local, remote } => {
            let uploader = driver
                .as_uploader()
                .ok_or_else(|| anyhow!("Driver {} cannot upload", driver.name()))?;

            let source = UploadSource::open(&local).await?;
            let progress: ProgressCallback = Arc::new(|done, total| {
                tracing::info!("uploaded {}/{} bytes ({}%)", done, total, percent(done, total));
            });
            let outcome = uploader.put_chunked(&remote, source, Some(progress), &cancel).await?;
            if outcome.rapid {
                println!("{} -> {} (rapid upload)", local.display(), outcome.remote_id);
            } else {
                println!("{} -> {} ({} bytes)", local.display(), outcome.remote_id, outcome.uploaded_bytes);
            }
        }
        Command::Get { remote, local, offset, length } => {
            let downloader = driver
                .as_downloader()
                .ok_or_else(|| anyhow!("Driver {} cannot download", driver.name()))?;

            let object = downloader.remote_object(&remote).await?;
            let reader = object.open_range(offset, length, cancel.clone());
            let mut file = tokio::fs::File::create(&local).await?;
            let mut written = 0u64;
            let copied: Result<()> = async {
                while let Some(block) = reader.next_bytes().await? {
                    file.write_all(&block).await?;
                    written += block.len() as u64;
                }
                file.flush().await?;
                reader.close().await?;
                Ok::<(), anyhow::Error>(())
            }
            .await;
            if let Err(e) = copied {
                // Untrusted or partial bytes are not kept / 不保留不可信数据
                drop(file);
                let _ = tokio::fs::remove_file(&local).await;
                return Err(e);
            }
            println!("{} -> {} ({} bytes)", remote, local.display(), written);
        }
        Command::Ls { remote } => {
            for entry in driver.list(&remote).await? {
                if entry.is_dir {
                    println!("{:>12}  {}/", "-", entry.name);
                } else {
                    println!("{:>12}  {}", entry.size, entry.name);
                }
            }
        }
        Command::Version => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_with_range_flags() {
        let cli = Cli::try_parse_from([
            "yaolist-transfer", "--root", "/srv/store", "get", "/a.bin", "out.bin", "--offset", "10", "--length", "5",
        ])
        .unwrap();
        assert_eq!(cli.root, PathBuf::from("/srv/store"));
        assert_eq!(cli.config, PathBuf::from("transfer.json"));
        match cli.command {
            Command::Get { remote, local, offset, length } => {
                assert_eq!(remote, "/a.bin");
                assert_eq!(local, PathBuf::from("out.bin"));
                assert_eq!((offset, length), (10, Some(5)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ls_defaults_to_root_and_put_needs_both_paths() {
        let cli = Cli::try_parse_from(["yaolist-transfer", "--http", "http://h/dav", "ls"]).unwrap();
        assert_eq!(cli.http.as_deref(), Some("http://h/dav"));
        assert!(matches!(cli.command, Command::Ls { ref remote } if remote == "/"));

        assert!(Cli::try_parse_from(["yaolist-transfer", "put", "only-local"]).is_err());
        assert!(Cli::try_parse_from(["yaolist-transfer"]).is_err());
    }
}
