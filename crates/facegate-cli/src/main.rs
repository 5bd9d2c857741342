use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::ImageInput;
use facegate_service::{BiometricService, Config};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "facegate", about = "Face verification for attendance check-in")]
struct Cli {
    /// TOML configuration file; FACEGATE_* environment variables are used when absent
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll (or re-enroll) a person from two or more images
    Enroll {
        identity: String,
        /// Image files; `-` reads base64 text from stdin
        #[arg(required = true, num_args = 1..)]
        images: Vec<String>,
    },
    /// Verify one image against an enrolled person
    Verify { identity: String, image: String },
    /// Inspect and administer enrollment profiles
    Profile {
        #[command(subcommand)]
        action: ProfileCommand,
    },
    /// Approve a check-in without biometric comparison (audited)
    Override {
        identity: String,
        #[arg(long)]
        operator: String,
        #[arg(long)]
        reason: String,
    },
    /// Show service status
    Status,
}

#[derive(Subcommand)]
enum ProfileCommand {
    Show { identity: String },
    List,
    Activate { identity: String },
    Deactivate { identity: String },
    /// Set the decision threshold (0 to 1)
    Threshold { identity: String, value: f32 },
    Remove { identity: String },
    /// List the manual override audit trail
    Overrides { identity: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::from_env(),
    };
    let service = BiometricService::open(&config)
        .await
        .context("failed to start facegate")?;

    match cli.command {
        Commands::Enroll { identity, images } => {
            let inputs = read_images(&images)?;
            let result = service.enroll(&identity, inputs).await;
            print_json(&result)?;
            if !result.success {
                std::process::exit(1);
            }
        }
        Commands::Verify { identity, image } => {
            let input = read_image(&image)?;
            let result = service.verify(&identity, input).await;
            print_json(&result)?;
            if !result.success {
                std::process::exit(1);
            }
        }
        Commands::Profile { action } => match action {
            ProfileCommand::Show { identity } => print_json(&service.profile(&identity).await?)?,
            ProfileCommand::List => print_json(&service.list_profiles().await?)?,
            ProfileCommand::Activate { identity } => {
                service.set_active(&identity, true).await?;
                println!("{identity}: activated");
            }
            ProfileCommand::Deactivate { identity } => {
                service.set_active(&identity, false).await?;
                println!("{identity}: deactivated");
            }
            ProfileCommand::Threshold { identity, value } => {
                service.set_threshold(&identity, value).await?;
                println!("{identity}: threshold set to {value}");
            }
            ProfileCommand::Remove { identity } => {
                service.remove_profile(&identity).await?;
                println!("{identity}: removed");
            }
            ProfileCommand::Overrides { identity } => print_json(&service.overrides(&identity).await?)?,
        },
        Commands::Override {
            identity,
            operator,
            reason,
        } => {
            let result = service.manual_override(&identity, &operator, &reason).await?;
            print_json(&result)?;
        }
        Commands::Status => print_json(&service.status().await?)?,
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Load image arguments: file paths as raw bytes, `-` as base64 text from stdin.
fn read_images(args: &[String]) -> Result<Vec<ImageInput>> {
    if args.iter().filter(|a| a.as_str() == "-").count() > 1 {
        bail!("stdin (`-`) can supply only one image");
    }
    args.iter().map(|arg| read_image(arg)).collect()
}

fn read_image(arg: &str) -> Result<ImageInput> {
    if arg == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("failed to read base64 image from stdin")?;
        return Ok(ImageInput::Base64(text));
    }
    let bytes = std::fs::read(Path::new(arg)).with_context(|| format!("failed to read {arg}"))?;
    Ok(ImageInput::Bytes(bytes))
}
