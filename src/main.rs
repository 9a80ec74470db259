use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use certificate_pipeline::{CertificatePipeline, Database, GenerationOutcome, PipelineConfig};

/// Generate certificates and transcripts for completed course claims
#[derive(Parser, Debug)]
#[command(name = "certificate-pipeline")]
#[command(about = "Generate numbered certificate and transcript documents for course claims")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate (or regenerate) the documents for a claim
    Generate {
        #[arg(long)]
        claim: Uuid,
        /// Use this registration number instead of allocating one
        #[arg(long)]
        registration_number: Option<String>,
    },
    /// Set a registration number on an existing certificate and regenerate it
    AddRegistration {
        #[arg(long)]
        claim: Uuid,
        #[arg(long)]
        number: String,
        /// Operator recorded as having added the number
        #[arg(long, env = "PIPELINE_OPERATOR")]
        by: String,
    },
    /// Print the generation log for a claim's certificate
    History {
        #[arg(long)]
        claim: Uuid,
    },
    /// Apply database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let args = Args::parse();
    let config = PipelineConfig::from_env().map_err(anyhow::Error::msg)?;

    let Some(database_url) = config.database_url.as_deref() else {
        bail!("DATABASE_URL must be set");
    };
    let db = Database::connect(database_url, config.database_max_connections)
        .await
        .context("failed to connect to database")?;

    if let Command::Migrate = args.command {
        db.run_migrations().await?;
        return Ok(());
    }

    let pipeline = CertificatePipeline::from_database(db, &config);

    match args.command {
        Command::Generate {
            claim,
            registration_number,
        } => {
            let outcome = pipeline
                .generate(claim, registration_number.as_deref())
                .await?;
            report(&outcome);
        }
        Command::AddRegistration { claim, number, by } => {
            let outcome = pipeline.add_registration_number(claim, &number, &by).await?;
            report(&outcome);
        }
        Command::History { claim } => {
            for entry in pipeline.history(claim).await? {
                println!(
                    "{}  {:<20} {}",
                    entry.created_at.to_rfc3339(),
                    entry.action,
                    entry.detail
                );
            }
        }
        Command::Migrate => {}
    }

    Ok(())
}

fn report(outcome: &GenerationOutcome) {
    let cert = &outcome.certificate;
    println!("claim:               {}", cert.claim_id);
    println!("status:              {}", cert.status);
    println!(
        "registration number: {}",
        cert.registration_number.as_deref().unwrap_or("-")
    );
    println!("units:               {}", outcome.unit_count);
    println!(
        "certificate:         {} ({})",
        cert.certificate_source_path.as_deref().unwrap_or("-"),
        cert.certificate_distribution_url.as_deref().unwrap_or("no pdf")
    );
    println!(
        "transcript:          {} ({})",
        cert.transcript_source_path.as_deref().unwrap_or("-"),
        cert.transcript_distribution_url.as_deref().unwrap_or("no pdf")
    );
    for (kind, reason) in &outcome.conversion_failures {
        println!("conversion failed for {}: {}", kind, reason);
    }
}
