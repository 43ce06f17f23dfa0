use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

// `#[zbus::proxy]` generates `AttendanceProxy` from this trait; method
// names map to the daemon's PascalCase D-Bus members.
#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn mark_attendance(&self) -> zbus::Result<String>;
    async fn register_user(&self, name: &str, email: &str, photo_path: &str)
        -> zbus::Result<String>;
    async fn list_users(&self) -> zbus::Result<String>;
    async fn attendance_report(&self, date: &str) -> zbus::Result<String>;
    async fn refresh_registry(&self) -> zbus::Result<()>;
    async fn repair_embeddings(&self) -> zbus::Result<u32>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new user from a photo
    Register {
        /// Display name of the user
        #[arg(short, long)]
        name: String,
        /// Optional email address
        #[arg(short, long)]
        email: Option<String>,
        /// Photo containing exactly one face
        photo: PathBuf,
    },
    /// Mark attendance for whoever is in front of the camera
    Mark,
    /// List registered users
    Users,
    /// Show attendance counts, optionally for one date
    Report {
        /// Date as YYYY-MM-DD; all time if omitted
        date: Option<String>,
    },
    /// Force the daemon to reload the face registry
    Refresh,
    /// Delete malformed embedding rows
    Repair,
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus — is rollcalld running?")?;
    let proxy = AttendanceProxy::new(&conn).await?;

    match cli.command {
        Commands::Register { name, email, photo } => {
            // The daemon reads the photo itself, so hand it an absolute path.
            let photo = photo
                .canonicalize()
                .with_context(|| format!("photo not found: {}", photo.display()))?;
            let reply = proxy
                .register_user(
                    &name,
                    email.as_deref().unwrap_or(""),
                    &photo.to_string_lossy(),
                )
                .await?;
            print_json(&reply);
        }
        Commands::Mark => print_json(&proxy.mark_attendance().await?),
        Commands::Users => print_json(&proxy.list_users().await?),
        Commands::Report { date } => {
            print_json(&proxy.attendance_report(date.as_deref().unwrap_or("")).await?)
        }
        Commands::Refresh => {
            proxy.refresh_registry().await?;
            println!("registry refreshed");
        }
        Commands::Repair => {
            let removed = proxy.repair_embeddings().await?;
            println!("removed {removed} malformed embedding rows");
        }
        Commands::Status => print_json(&proxy.status().await?),
    }

    Ok(())
}

/// Pretty-print a JSON reply, falling back to raw output if it does not
/// parse.
fn print_json(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => println!(
            "{}",
            serde_json::to_string_pretty(&value).unwrap_or_else(|_| raw.to_string())
        ),
        Err(_) => println!("{raw}"),
    }
}
