//! Campus: realtime cache sync for the chat UI
//!
//! Main binary with subcommands:
//! - `watch`: Connect to Supabase Realtime and log every cache action
//! - `replay`: Feed recorded change events through the router offline

use std::path::PathBuf;

use campus_sync::SyncConfig;
use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod replay;
mod watch;

#[derive(Parser)]
#[command(name = "campus")]
#[command(about = "Realtime cache synchronization for Campus", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Overrides shared by both subcommands.
#[derive(Args)]
struct SyncArgs {
    /// JSON file with sync settings (all fields optional)
    #[arg(long, env = "CAMPUS_CONFIG")]
    config: Option<PathBuf>,

    /// Quiet period in milliseconds before a list refresh fires
    #[arg(long)]
    quiet_ms: Option<u64>,
}

impl SyncArgs {
    async fn load(&self) -> Result<SyncConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let json = tokio::fs::read_to_string(path).await.map_err(|e| {
                    miette::miette!("failed to read config {}: {}", path.display(), e)
                })?;
                SyncConfig::from_json(&json).map_err(|e| miette::miette!("{}", e))?
            }
            None => SyncConfig::default(),
        };
        if let Some(quiet_ms) = self.quiet_ms {
            config.quiet_period_ms = quiet_ms;
        }
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a Realtime endpoint and log cache invalidations and presence
    Watch {
        /// Project URL or Realtime websocket URL
        #[arg(long, env = "CAMPUS_REALTIME_URL")]
        url: String,

        /// API key sent with the websocket handshake
        #[arg(long, env = "CAMPUS_API_KEY")]
        api_key: String,

        /// Staff user id used as the presence key
        #[arg(long, env = "CAMPUS_SUBJECT_ID")]
        subject_id: String,

        /// Name shown in other users' online list
        #[arg(long, env = "CAMPUS_DISPLAY_NAME")]
        display_name: String,

        /// Presence channel name
        #[arg(long, default_value = "online-users")]
        presence_topic: String,

        /// Presence heartbeat interval in seconds
        #[arg(long)]
        heartbeat_secs: Option<u64>,

        /// Seconds without a heartbeat before a peer counts as offline
        #[arg(long)]
        stale_secs: Option<u64>,

        #[command(flatten)]
        sync: SyncArgs,
    },

    /// Replay a JSON-lines file of change events and print a coalescing report
    Replay {
        /// File with one `{"table","type","record","old_record","delay_ms"}` object per line
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Playback speed multiplier for recorded delays
        #[arg(long, default_value = "1.0")]
        speed: f64,

        #[command(flatten)]
        sync: SyncArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| {
                "campus=info,campus_sync=info,campus_realtime=info".to_string()
            }),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch {
            url,
            api_key,
            subject_id,
            display_name,
            presence_topic,
            heartbeat_secs,
            stale_secs,
            sync,
        } => {
            let mut config = sync.load().await?;
            if let Some(secs) = heartbeat_secs {
                config.heartbeat_secs = secs;
            }
            if let Some(secs) = stale_secs {
                config.stale_secs = secs;
            }
            watch::run(watch::WatchOptions {
                url,
                api_key,
                subject_id,
                display_name,
                presence_topic,
                config,
            })
            .await
        }

        Commands::Replay { file, speed, sync } => {
            if !(speed.is_finite() && speed > 0.0) {
                return Err(miette::miette!("--speed must be a positive number"));
            }
            let config = sync.load().await?;
            let steps = replay::load(&file)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            let report = replay::replay(steps, config, speed)
                .await
                .map_err(|e| miette::miette!("replay failed: {}", e))?;
            println!("{}", report.render());
            Ok(())
        }
    }
}
