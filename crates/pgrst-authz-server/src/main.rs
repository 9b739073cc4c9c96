use anyhow::Result;
use clap::Parser;

use pgrst_authz::{MintClaims, mint_token};
use pgrst_authz_server::ServerBuilder;
use pgrst_authz_server::cli::{Cli, Commands, MintTokenArgs, ServeArgs};
use pgrst_authz_server::config::loader::load_config;

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist - it's optional
        if !matches!(
            e,
            dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound
        ) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    pgrst_authz_server::observability::init_tracing();

    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::MintToken(args) => {
            print_token(args)?;
            Ok(())
        }
    }
}

async fn serve(args: &ServeArgs) -> Result<()> {
    let cfg = match load_config(args.config.as_deref(), &args.overrides()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    pgrst_authz_server::observability::apply_logging_level(&cfg.logging.level);

    tracing::info!(
        engine = cfg.policy.engine.as_str(),
        policy = %cfg.policy.policy_path.display(),
        "Configuration loaded"
    );

    let server = ServerBuilder::new().with_config(cfg).build().await?;
    server.run().await
}

fn print_token(args: &MintTokenArgs) -> Result<()> {
    let mut claims = MintClaims::new(&args.id, &args.role);
    if let Some(secs) = args.expires_in {
        claims = claims.expires_in(secs);
    }
    let token = mint_token(args.hmac.as_bytes(), &claims)?;
    println!("{token}");
    Ok(())
}
