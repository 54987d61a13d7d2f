use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use shared::{
    domain::{MissionStatus, ProfileRole, UserId},
    protocol::{CreateMissionRequest, MissionQuery},
};
use storage::Storage;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/fieldops.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateProfile {
        email: String,
        display_name: String,
        /// admin, employee or subcontractor
        role: ProfileRole,
    },
    DeactivateProfile {
        user_id: UserId,
    },
    CreateMission {
        /// Email of the staff profile recorded as creator.
        created_by: String,
        reference: String,
        title: String,
        #[arg(long)]
        customer_name: Option<String>,
        #[arg(long)]
        address: Option<String>,
        #[arg(long)]
        price_cents: Option<i64>,
    },
    ListMissions {
        #[arg(long)]
        status: Vec<MissionStatus>,
        #[arg(long)]
        search: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateProfile {
            email,
            display_name,
            role,
        } => {
            let profile = storage.create_profile(&email, &display_name, role).await?;
            info!(user_id = %profile.id, %role, "profile created");
            println!("created user_id={}", profile.id);
        }
        Command::DeactivateProfile { user_id } => {
            if !storage.set_profile_active(user_id, false).await? {
                bail!("no profile with id {user_id}");
            }
            println!("deactivated user_id={user_id}");
        }
        Command::CreateMission {
            created_by,
            reference,
            title,
            customer_name,
            address,
            price_cents,
        } => {
            let creator = storage
                .profile_by_email(&created_by)
                .await?
                .with_context(|| format!("no profile with email {created_by}"))?;
            if !creator.role.is_staff() {
                bail!("{created_by} is not allowed to create missions");
            }
            let mission = storage
                .insert_mission(
                    creator.id,
                    &CreateMissionRequest {
                        reference,
                        title,
                        customer_name,
                        address,
                        price_cents,
                        ..CreateMissionRequest::default()
                    },
                )
                .await?;
            println!("created mission_id={} reference={}", mission.id, mission.reference);
        }
        Command::ListMissions { status, search } => {
            let query = MissionQuery {
                statuses: status,
                search,
                ..MissionQuery::default()
            };
            for mission in storage.query_missions(&query, None).await? {
                println!("{}\t{}\t{}\t{}", mission.id, mission.reference, mission.status, mission.title);
            }
        }
    }

    Ok(())
}
