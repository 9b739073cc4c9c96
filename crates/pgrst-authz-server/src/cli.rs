use clap::{Parser, Subcommand};

use crate::config::ConfigOverrides;

#[derive(Parser)]
#[command(name = "pgrst-authz")]
#[command(about = "Authorization decisions for PostgREST behind a reverse proxy")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the authorization service
    Serve(ServeArgs),
    /// Print a signed bearer token for local testing
    MintToken(MintTokenArgs),
}

#[derive(clap::Args)]
pub struct ServeArgs {
    /// Configuration file (defaults to pgrst-authz.toml when present)
    #[arg(short, long, env = "PGRST_AUTHZ_CONFIG")]
    pub config: Option<String>,
    /// Shared HMAC secret for bearer tokens
    #[arg(long, env = "PGRST_AUTHZ_HMAC", hide_env_values = true)]
    pub hmac: Option<String>,
    /// Policy file to load and watch
    #[arg(long)]
    pub policy: Option<String>,
    /// Policy backend: rego, cedar or quickjs
    #[arg(long)]
    pub engine: Option<String>,
    /// Reuse QuickJS runtimes across requests
    #[arg(long)]
    pub pool: Option<bool>,
    /// Listen address
    #[arg(long)]
    pub host: Option<String>,
    /// Listen port
    #[arg(short, long)]
    pub port: Option<u16>,
}

impl ServeArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            hmac_secret: self.hmac.clone(),
            policy_path: self.policy.clone(),
            engine: self.engine.clone(),
            pool_enabled: self.pool,
            host: self.host.clone(),
            port: self.port,
        }
    }
}

#[derive(clap::Args)]
pub struct MintTokenArgs {
    /// Shared HMAC secret to sign with
    #[arg(long, env = "PGRST_AUTHZ_HMAC", hide_env_values = true)]
    pub hmac: String,
    /// Role claim
    #[arg(long, default_value = "anon")]
    pub role: String,
    /// Principal id claim
    #[arg(long, default_value = "bar")]
    pub id: String,
    /// Lifetime in seconds; no expiry when omitted
    #[arg(long)]
    pub expires_in: Option<u64>,
}
