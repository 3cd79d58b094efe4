use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use media_sync_core::api::{DaemonClient, DaemonClientBuilder, MediaUpload, RealtimeClient};
use media_sync_core::{AcquisitionRequest, CatalogFilter, Category, MediaEvent, SyncRequest};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, Level};

#[derive(Parser)]
#[command(name = "media-sync")]
#[command(about = "Control the media-sync daemon: devices, sync jobs, imports and the library")]
#[command(version)]
struct Cli {
    /// Daemon base URL
    #[arg(long, global = true, default_value = "http://localhost:3001")]
    url: String,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    Yaml,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the daemon is up
    Health,
    /// Show the connected removable device
    Device,
    /// Show what a sync would copy, skip and leave orphaned
    Diff,
    /// Start a sync to the connected device
    Sync {
        /// Delete every orphan currently on the device
        #[arg(long)]
        delete_orphans: bool,
        /// Delete this orphan (repeatable)
        #[arg(long = "orphan", value_name = "PATH")]
        orphans: Vec<String>,
    },
    /// Show the current or last sync job
    Status,
    /// Eject the connected device
    Eject,
    /// Queue a download into the library
    Import {
        url: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        artist: String,
        #[arg(long)]
        category: Category,
        /// Duration in seconds, if known
        #[arg(long)]
        duration: Option<u32>,
    },
    /// Upload a local mp3 into the library
    Upload {
        file: PathBuf,
        #[arg(long)]
        title: String,
        #[arg(long)]
        artist: String,
        #[arg(long)]
        category: Category,
        /// Duration in seconds, if known
        #[arg(long)]
        duration: Option<u32>,
    },
    /// Look up title, uploader and duration for a URL
    Prefetch { url: String },
    /// List recent import jobs
    Jobs,
    /// Show one import job
    Job { id: i64 },
    /// List library entries
    Media {
        #[arg(long)]
        category: Option<Category>,
        #[arg(long)]
        artist: Option<String>,
    },
    /// Stream push events until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::WARN })
        .with_writer(std::io::stderr)
        .init();

    let client = DaemonClientBuilder::new(cli.url.clone())
        .timeout(Duration::from_secs(30))
        .build()?;
    let output = cli.output;

    match cli.command {
        Commands::Health => {
            let health = client.health_check().await?;
            emit(output, &health, |h| format!("✅ Daemon at {} is {}", cli.url, h.status))
        }
        Commands::Device => {
            let device = client.device().await?;
            emit(output, &device, |device| match device {
                Some(d) => format!(
                    "{} at {} ({} free of {})",
                    d.label,
                    d.mount_path.display(),
                    human_bytes(d.free_bytes),
                    human_bytes(d.total_bytes)
                ),
                None => "No removable device connected".to_string(),
            })
        }
        Commands::Diff => {
            let diff = client.diff().await?;
            emit(output, &diff, |diff| {
                let mut lines = vec![format!(
                    "{} to copy ({}), {} up to date, {} orphans ({})",
                    diff.to_copy.len(),
                    human_bytes(diff.bytes_to_copy()),
                    diff.to_skip.len(),
                    diff.orphans.len(),
                    human_bytes(diff.orphan_bytes())
                )];
                lines.extend(diff.to_copy.iter().map(|e| format!("  + {}", e.relative_path)));
                lines.extend(diff.orphans.iter().map(|e| format!("  ? {}", e.relative_path)));
                lines.join("\n")
            })
        }
        Commands::Sync { delete_orphans, orphans } => {
            let mut request = SyncRequest { delete_orphans: orphans };
            if delete_orphans {
                let diff = client.diff().await?;
                request
                    .delete_orphans
                    .extend(diff.orphans.into_iter().map(|e| e.relative_path));
            }
            request.delete_orphans.sort();
            request.delete_orphans.dedup();

            info!(orphans = request.delete_orphans.len(), "Starting sync");
            client.start_sync(&request).await?;
            emit(output, &request, |r| {
                format!("🔄 Sync started ({} orphans to delete)", r.delete_orphans.len())
            })
        }
        Commands::Status => {
            let job = client.sync_status().await?;
            emit(output, &job, |job| match job {
                None => "No sync has run".to_string(),
                Some(job) => match (&job.progress, &job.summary, &job.error) {
                    (_, Some(s), _) => format!(
                        "Complete: {} copied, {} skipped, {} deleted in {}s",
                        s.copied, s.skipped, s.deleted, s.duration_seconds
                    ),
                    (_, _, Some(e)) => format!("Failed: {}", e),
                    (Some(p), _, _) => format!(
                        "Syncing {}/{}: {} ({}/s)",
                        p.copied,
                        p.total,
                        p.current_file,
                        human_bytes(p.bytes_per_second)
                    ),
                    _ => "Syncing".to_string(),
                },
            })
        }
        Commands::Eject => {
            client.eject().await?;
            emit(output, &serde_json::json!({ "ejected": true }), |_| {
                "⏏️  Device ejected".to_string()
            })
        }
        Commands::Import {
            url,
            title,
            artist,
            category,
            duration,
        } => {
            let request = AcquisitionRequest {
                url,
                title,
                artist,
                category,
                duration_seconds: duration,
            };
            let job_id = client.submit_import(&request).await?;
            emit(output, &serde_json::json!({ "jobId": job_id }), |_| {
                format!("📥 Import queued as job {}", job_id)
            })
        }
        Commands::Upload {
            file,
            title,
            artist,
            category,
            duration,
        } => {
            let upload = MediaUpload {
                title,
                artist,
                category,
                duration_seconds: duration,
            };
            let entry = client.upload_media(&file, &upload).await?;
            emit(output, &entry, |e| {
                format!("📤 Added {} - {} as {}", e.artist, e.title, e.file_path.display())
            })
        }
        Commands::Prefetch { url } => {
            let metadata = client.prefetch(&url).await?;
            emit(output, &metadata, |m| {
                format!("{} by {} ({}s)", m.title, m.artist, m.duration_seconds)
            })
        }
        Commands::Jobs => {
            let jobs = client.import_jobs().await?;
            emit(output, &jobs, |jobs| {
                if jobs.is_empty() {
                    return "No import jobs".to_string();
                }
                jobs.iter()
                    .map(|j| format!("#{:<5} {:<12} {:>3}%  {}", j.id, j.status, j.progress_percent, j.source_url))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        Commands::Job { id } => {
            let job = client.import_job(id).await?;
            emit(output, &job, |j| {
                let mut text = format!("#{} {} {}% {}", j.id, j.status, j.progress_percent, j.source_url);
                if let Some(error) = &j.error_message {
                    text.push_str(&format!("\n  error: {}", error));
                }
                if let Some(entry) = j.result_entry_id {
                    text.push_str(&format!("\n  media item: {}", entry));
                }
                text
            })
        }
        Commands::Media { category, artist } => {
            let entries = client.media(&CatalogFilter { category, artist }).await?;
            emit(output, &entries, |entries| {
                entries
                    .iter()
                    .map(|e| format!("{:<5} {:<11} {} - {}", e.id, e.category, e.artist, e.title))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        Commands::Watch => watch(&client, output).await,
    }
}

/// Print `value` in the chosen format; `text` renders the human form
fn emit<T: Serialize>(format: OutputFormat, value: &T, text: impl FnOnce(&T) -> String) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{}", text(value)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

async fn watch(client: &DaemonClient, output: OutputFormat) -> Result<()> {
    let mut realtime = RealtimeClient::new(client.base_url())?;
    let mut events = realtime.subscribe();
    realtime.connect();
    eprintln!("Watching {} (Ctrl+C to stop)", realtime.ws_url());

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => print_event(output, &event)?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                debug!("Interrupted");
                break;
            }
        }
    }

    realtime.disconnect().await;
    Ok(())
}

fn print_event(output: OutputFormat, event: &MediaEvent) -> Result<()> {
    match output {
        // One event per line so the stream can be piped
        OutputFormat::Json => println!("{}", event.to_json()?),
        OutputFormat::Yaml => print!("---\n{}", serde_yaml::to_string(event)?),
        OutputFormat::Text => {
            let line = match event {
                MediaEvent::UsbConnected(d) => format!("🔌 {} connected at {}", d.label, d.mount_path.display()),
                MediaEvent::UsbDisconnected(d) => format!("⏏️  {} disconnected", d.mount_path.display()),
                MediaEvent::SyncProgress(p) => format!("🔄 {}/{} {}", p.copied, p.total, p.current_file),
                MediaEvent::SyncComplete(s) => format!(
                    "✅ Sync complete: {} copied, {} skipped, {} deleted",
                    s.copied, s.skipped, s.deleted
                ),
                MediaEvent::SyncError(e) => format!("❌ Sync failed: {}", e.message),
                MediaEvent::DownloadProgress(p) => format!("📥 job {} {} {}%", p.job_id, p.status, p.percent),
                MediaEvent::DownloadComplete(c) => {
                    format!("✅ job {} added {} - {}", c.job_id, c.entry.artist, c.entry.title)
                }
                MediaEvent::DownloadError(e) => format!("❌ job {}: {}", e.job_id, e.message),
            };
            println!("{}", line);
        }
    }
    Ok(())
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
