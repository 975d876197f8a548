use std::path::PathBuf;

use clap::{Parser, Subcommand};
use nohands_pipeline::{build_image, ImageBuildRequest, RegistryAuth};

#[derive(Parser)]
#[command(name = "nohands-pipeline", about = "NoHands Docker image pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build an image from a local checkout
    Build {
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        image: String,
        #[arg(long, default_value = "latest")]
        tag: String,
        #[arg(long, default_value = "Dockerfile")]
        dockerfile: String,
        /// Registry to push to (password read from DOCKER_REGISTRY_PASSWORD)
        #[arg(long)]
        registry: Option<String>,
        #[arg(long)]
        registry_username: Option<String>,
    },
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    // Stdout carries the build result; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
    let Cli { command } = Cli::parse();

    match command {
        Command::Build {
            source,
            image,
            tag,
            dockerfile,
            registry,
            registry_username,
        } => {
            let password = std::env::var("DOCKER_REGISTRY_PASSWORD").ok();
            let registry = RegistryAuth::from_parts(
                registry.as_deref(),
                registry_username.as_deref(),
                password.as_deref(),
            );

            let outcome = build_image(ImageBuildRequest {
                source_dir: source,
                dockerfile_path: dockerfile,
                dockerfile_content: None,
                image_name: image,
                image_tag: tag,
                registry,
            })
            .await;

            println!("{}", outcome.logs);
            if !outcome.is_success() {
                eyre::bail!(outcome.error_message);
            }
            println!("\n=== Image ready: {} ===", outcome.image_tag);
        }
    }

    Ok(())
}
