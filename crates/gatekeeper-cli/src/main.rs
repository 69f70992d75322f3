use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use gatekeeper_core::{AccessStatus, StatusKind};
use gatekeeper_hw::Camera;

#[zbus::proxy(
    interface = "org.freedesktop.Gatekeeper1",
    default_service = "org.freedesktop.Gatekeeper1",
    default_path = "/org/freedesktop/Gatekeeper1"
)]
trait Gatekeeper {
    async fn status(&self) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;

    #[zbus(signal)]
    fn access_changed(&self, status: String) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "gatekeeper", about = "Gatekeeper face access control CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the current access status
    Status,
    /// List enrolled identities
    Identities,
    /// Follow access decisions as they happen
    Watch,
    /// List V4L2 capture devices
    Devices,
}

async fn connect(session: bool) -> Result<zbus::Connection> {
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    };
    conn.context("cannot reach D-Bus; is gatekeeperd running?")
}

fn describe(json: &str) -> String {
    match serde_json::from_str::<AccessStatus>(json) {
        Ok(status) => {
            let decision = match &status.kind {
                StatusKind::Pending => "pending".to_string(),
                StatusKind::Granted(name) => format!("granted ({name})"),
                StatusKind::Denied => "denied".to_string(),
                StatusKind::NoMatch => "no match".to_string(),
            };
            format!(
                "#{:<6} {}  {}",
                status.sequence,
                status.timestamp.format("%Y-%m-%d %H:%M:%S"),
                decision
            )
        }
        Err(_) => json.to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let conn = connect(cli.session).await?;
            let proxy = GatekeeperProxy::new(&conn).await?;
            println!("{}", describe(&proxy.status().await?));
        }
        Commands::Identities => {
            let conn = connect(cli.session).await?;
            let proxy = GatekeeperProxy::new(&conn).await?;
            let list: serde_json::Value = serde_json::from_str(&proxy.list_identities().await?)
                .context("daemon returned malformed identity list")?;
            let entries = list.as_array().cloned().unwrap_or_default();
            if entries.is_empty() {
                println!("No identities enrolled");
            }
            for entry in entries {
                println!(
                    "{:<24} {} reference(s)",
                    entry["name"].as_str().unwrap_or("?"),
                    entry["embeddings"]
                );
            }
        }
        Commands::Watch => {
            let conn = connect(cli.session).await?;
            let proxy = GatekeeperProxy::new(&conn).await?;
            let mut changes = proxy.receive_access_changed().await?;
            println!("{}", describe(&proxy.status().await?));
            while let Some(signal) = changes.next().await {
                let args = signal.args()?;
                println!("{}", describe(args.status()));
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{:<14} {} [{}] {}", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
    }

    Ok(())
}
