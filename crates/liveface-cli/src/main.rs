use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

#[zbus::proxy(
    interface = "org.liveface.Liveface1",
    default_service = "org.liveface.Liveface1",
    default_path = "/org/liveface/Liveface1"
)]
trait Liveface {
    fn upload_identity(&self, image: &[u8]) -> zbus::Result<String>;
    fn reset_identity(&self) -> zbus::Result<bool>;
    fn submit_blink_frame(&self, session_id: &str, image: &[u8]) -> zbus::Result<String>;
    fn submit_turn_frame(
        &self,
        session_id: &str,
        direction: &str,
        image: &[u8],
    ) -> zbus::Result<String>;
    fn session_status(&self, session_id: &str) -> zbus::Result<String>;
    fn reset_session(&self, session_id: &str) -> zbus::Result<bool>;
    fn reset_all(&self) -> zbus::Result<u32>;
    fn health(&self) -> zbus::Result<String>;
}

#[derive(Parser, Debug)]
#[command(name = "liveface", version, about = "Liveface liveness challenge client")]
struct Cli {
    /// Talk to the daemon on the session bus (development mode)
    #[arg(long, global = true)]
    session_bus: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload the identity photo that head turns are matched against
    UploadId { photo: PathBuf },
    /// Remove the enrolled identity photo
    ResetId,
    /// Submit frames for the blink challenge, in order
    Blink {
        /// Session to submit into (a new one is generated if omitted)
        #[arg(long)]
        session_id: Option<String>,
        #[arg(required = true)]
        frames: Vec<PathBuf>,
    },
    /// Submit frames for a head-turn challenge, in order
    Turn {
        #[arg(long)]
        session_id: Option<String>,
        #[arg(value_enum)]
        direction: TurnDirection,
        #[arg(required = true)]
        frames: Vec<PathBuf>,
    },
    /// Show a session's progress
    Status { session_id: String },
    /// Discard one session
    Reset { session_id: String },
    /// Discard every session
    ResetAll,
    /// Show daemon health
    Health,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum TurnDirection {
    Left,
    Right,
}

impl TurnDirection {
    fn as_str(self) -> &'static str {
        match self {
            TurnDirection::Left => "left",
            TurnDirection::Right => "right",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let session_bus = cli.session_bus || std::env::var_os("LIVEFACE_SESSION_BUS").is_some();
    let conn = if session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = LivefaceProxy::new(&conn)
        .await
        .context("failed to reach livefaced; is the daemon running?")?;

    match cli.command {
        Command::UploadId { photo } => {
            let image = read_image(&photo)?;
            print_json(&proxy.upload_identity(&image).await?)?;
        }
        Command::ResetId => {
            let removed = proxy.reset_identity().await?;
            println!("{}", if removed { "identity removed" } else { "no identity enrolled" });
        }
        Command::Blink { session_id, frames } => {
            let session_id = session_or_new(session_id);
            for path in &frames {
                let image = read_image(path)?;
                tracing::debug!(frame = %path.display(), "submitting blink frame");
                print_json(&proxy.submit_blink_frame(&session_id, &image).await?)?;
            }
        }
        Command::Turn {
            session_id,
            direction,
            frames,
        } => {
            let session_id = session_or_new(session_id);
            for path in &frames {
                let image = read_image(path)?;
                tracing::debug!(frame = %path.display(), direction = direction.as_str(), "submitting turn frame");
                print_json(
                    &proxy
                        .submit_turn_frame(&session_id, direction.as_str(), &image)
                        .await?,
                )?;
            }
        }
        Command::Status { session_id } => {
            let status = proxy.session_status(&session_id).await?;
            if status == "null" {
                anyhow::bail!("no such session: {session_id}");
            }
            print_json(&status)?;
        }
        Command::Reset { session_id } => {
            if proxy.reset_session(&session_id).await? {
                println!("session {session_id} reset");
            } else {
                println!("no such session: {session_id}");
            }
        }
        Command::ResetAll => {
            let count = proxy.reset_all().await?;
            println!("{count} session(s) reset");
        }
        Command::Health => print_json(&proxy.health().await?)?,
    }

    Ok(())
}

fn session_or_new(session_id: Option<String>) -> String {
    session_id.unwrap_or_else(|| {
        let id = uuid::Uuid::new_v4().to_string();
        eprintln!("session: {id}");
        id
    })
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Re-indent a JSON reply from the daemon.
fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
