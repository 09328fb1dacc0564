use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use buddyrelay::credentials::{CredentialRecord, CredentialStore};
use buddyrelay::util::{cors_config_from_env, init_tracing, AppState};
use buddyrelay::{server, CredentialRotator, Settings, UsageRecorder};
use std::sync::Arc;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "buddyrelay")]
#[command(version, about = "OpenAI-compatible proxy over a rotating credential pool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    Serve,
    /// Store a new credential in the credential directory
    AddCredential {
        #[arg(short, long)]
        token: String,
        #[arg(short, long)]
        user_id: Option<String>,
        /// File name to write (derived from user id and time when omitted)
        #[arg(short, long)]
        file: Option<String>,
    },
    /// Show loaded credentials without exposing tokens
    ListCredentials,
    /// Remove a credential file by handle
    DeleteCredential { handle: String },
}

#[actix_web::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(settings).await,
        Commands::AddCredential {
            token,
            user_id,
            file,
        } => {
            let store = CredentialStore::new(&settings.creds_dir);
            let record = CredentialRecord::new(token, user_id);
            let handle = store
                .persist(&record, file.as_deref())
                .context("failed to write credential")?;
            println!("Saved credential {}", handle);
            Ok(())
        }
        Commands::ListCredentials => {
            let store = CredentialStore::new(&settings.creds_dir);
            let now = buddyrelay::util::now_epoch() as i64;
            let credentials = store.load_all().context("failed to read credentials")?;
            if credentials.is_empty() {
                println!("No credentials in {}", settings.creds_dir.display());
            }
            for (i, c) in credentials.iter().enumerate() {
                let s = c.summary(i, now);
                println!(
                    "#{} {} user={} token={} {}",
                    i,
                    s.handle,
                    s.user_id.as_deref().unwrap_or("-"),
                    s.token_preview,
                    if s.expired { "EXPIRED" } else { "valid" }
                );
            }
            Ok(())
        }
        Commands::DeleteCredential { handle } => {
            let rotator = CredentialRotator::new(
                CredentialStore::new(&settings.creds_dir),
                Arc::new(UsageRecorder::new()),
                settings.rotation_count,
            )
            .context("failed to read credentials")?;
            rotator
                .delete(&handle)
                .with_context(|| format!("failed to delete credential {}", handle))?;
            println!("Deleted credential {}", handle);
            Ok(())
        }
    }
}

async fn serve(settings: Settings) -> Result<()> {
    if settings.password.is_none() {
        tracing::warn!("BUDDYRELAY_PASSWORD is not set; protected routes will answer 500");
    }
    let addr = settings.bind_addr();
    let state = AppState::from_settings(settings).context("failed to initialise state")?;
    tracing::info!(
        "Loaded {} credential(s); listening on http://{}",
        state.rotator.len(),
        addr
    );

    let data = web::Data::new(state);
    HttpServer::new(move || {
        App::new()
            .wrap(cors_config_from_env())
            .app_data(data.clone())
            .app_data(web::JsonConfig::default().limit(32 * 1024 * 1024))
            .app_data(web::PayloadConfig::new(32 * 1024 * 1024))
            .configure(server::config_routes)
    })
    .bind(&addr)
    .with_context(|| format!("failed to bind {}", addr))?
    .run()
    .await?;
    Ok(())
}
