use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

// D-Bus proxy for the facegated service.
#[zbus::proxy(
    interface = "org.facegate.Gate1",
    default_service = "org.facegate.Gate1",
    default_path = "/org/facegate/Gate1"
)]
trait Gate {
    async fn login(&self, email: &str, password: &str) -> zbus::Result<String>;
    async fn logout(&self, token: &str) -> zbus::Result<bool>;
    async fn create_event(&self, token: &str, event_json: &str) -> zbus::Result<String>;
    async fn list_events(&self, active_only: bool) -> zbus::Result<String>;
    async fn register_ticket(
        &self,
        event_id: &str,
        name: &str,
        email: &str,
        national_id: &str,
        class: &str,
    ) -> zbus::Result<String>;
    async fn confirm_payment(&self, ticket_id: &str) -> zbus::Result<String>;
    async fn enroll_face(&self, ticket_id: &str, capture: Vec<u8>) -> zbus::Result<String>;
    async fn verify_gate(
        &self,
        token: &str,
        event_id: &str,
        claim_email: &str,
        capture: Vec<u8>,
    ) -> zbus::Result<String>;
    async fn capacity_remaining(&self, event_id: &str) -> zbus::Result<u32>;
    async fn list_tickets(&self, token: &str, event_id: &str) -> zbus::Result<String>;
    async fn expire_ticket(&self, token: &str, ticket_id: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate biometric ticketing CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in as an operator; prints the session (keep the token)
    Login {
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
    },
    /// Invalidate a session token
    Logout {
        #[arg(long)]
        token: String,
    },
    /// List events
    Events {
        /// Only events accepting registrations
        #[arg(long)]
        active: bool,
    },
    /// Create an event (requires a manager session)
    CreateEvent {
        #[arg(long)]
        token: String,
        /// Event JSON: {"name", "schedule", "location", "is_free", "price", "max_capacity"}
        json: String,
    },
    /// Register a ticket for an event
    Register {
        #[arg(long)]
        event: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        national_id: String,
        /// Ticket class: free, standard, vip, backstage
        #[arg(long, default_value = "standard")]
        class: String,
    },
    /// Confirm payment for a pending ticket
    Pay {
        /// Ticket ID
        id: String,
    },
    /// Enroll the holder's face from a JPEG capture
    Enroll {
        /// Ticket ID
        id: String,
        /// Path to a JPEG capture
        #[arg(long)]
        image: PathBuf,
    },
    /// Run a gate verification attempt (requires an operator session)
    Gate {
        #[arg(long)]
        token: String,
        #[arg(long)]
        event: String,
        /// Claimed holder email
        #[arg(long)]
        email: String,
        /// Path to the live JPEG capture
        #[arg(long)]
        image: PathBuf,
    },
    /// Remaining capacity for an event
    Capacity {
        /// Event ID
        event: String,
    },
    /// List an event's tickets (requires a manager session)
    Tickets {
        #[arg(long)]
        token: String,
        #[arg(long)]
        event: String,
    },
    /// Expire a ticket (requires an admin session)
    Expire {
        #[arg(long)]
        token: String,
        /// Ticket ID
        id: String,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let connection = zbus::Connection::session()
        .await
        .context("connect to session bus (is facegated running?)")?;
    let gate = GateProxy::new(&connection).await?;

    match cli.command {
        Commands::Login { email, password } => {
            print_json(&gate.login(&email, &password).await?)?;
        }
        Commands::Logout { token } => {
            if gate.logout(&token).await? {
                println!("session invalidated");
            } else {
                println!("no such session");
            }
        }
        Commands::Events { active } => {
            print_json(&gate.list_events(active).await?)?;
        }
        Commands::CreateEvent { token, json } => {
            print_json(&gate.create_event(&token, &json).await?)?;
        }
        Commands::Register {
            event,
            name,
            email,
            national_id,
            class,
        } => {
            print_json(
                &gate
                    .register_ticket(&event, &name, &email, &national_id, &class)
                    .await?,
            )?;
        }
        Commands::Pay { id } => {
            print_json(&gate.confirm_payment(&id).await?)?;
        }
        Commands::Enroll { id, image } => {
            let capture = read_capture(&image)?;
            print_json(&gate.enroll_face(&id, capture).await?)?;
        }
        Commands::Gate {
            token,
            event,
            email,
            image,
        } => {
            let capture = read_capture(&image)?;
            let raw = gate.verify_gate(&token, &event, &email, capture).await?;
            let result: serde_json::Value = serde_json::from_str(&raw)?;
            print_verification(&result);
        }
        Commands::Capacity { event } => {
            println!("{}", gate.capacity_remaining(&event).await?);
        }
        Commands::Tickets { token, event } => {
            print_json(&gate.list_tickets(&token, &event).await?)?;
        }
        Commands::Expire { token, id } => {
            print_json(&gate.expire_ticket(&token, &id).await?)?;
        }
        Commands::Status => {
            print_json(&gate.status().await?)?;
        }
    }

    Ok(())
}

fn read_capture(path: &PathBuf) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("read capture {}", path.display()))
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_verification(result: &serde_json::Value) {
    let granted = result["granted"].as_bool().unwrap_or(false);
    let reason = result["reason"].as_str().unwrap_or("no reason reported");
    if granted {
        let holder = result["ticket"]["holder_name"].as_str().unwrap_or("unknown holder");
        println!("ACCESS GRANTED: {holder} ({reason})");
    } else {
        println!("DENIED: {reason}");
        if result["retryable"].as_bool() == Some(true) {
            println!("(operator may retry with a new capture)");
        }
    }
}
