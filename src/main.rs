//! SAML Service Provider Agent
//!
//! Adds SAML2 single sign-on and single logout to a host web application.
//! The IdP exchange is translated into host sessions carrying the
//! authenticated user, their groups and a resolved role.

mod authz;
mod error;
mod handler;
mod mapping;
mod saml;
mod session;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use authz::SessionAuthController;
use handler::SamlAuth;
use saml::{SamlConfig, SamlProvider};
use session::{spawn_cleanup_task, SessionStore};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "saml-sp-agent")]
#[command(about = "SAML2 Service Provider for host application login")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8080", env = "SAML_SP_LISTEN")]
    listen: SocketAddr,

    /// Path to the JSON configuration file
    #[arg(long, env = "SAML_SP_CONFIG")]
    config: PathBuf,

    /// Session database path, overrides the configuration file
    #[arg(long, env = "SAML_SESSION_STORE_PATH")]
    session_store: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, env = "SAML_SP_VERBOSE")]
    verbose: bool,
}

/// Load the configuration and apply command line overrides.
fn load_config(args: &Args) -> Result<SamlConfig> {
    let mut config = SamlConfig::from_file(&args.config)?;

    if let Some(ref path) = args.session_store {
        config.session_store_path = path.display().to_string();
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        .json()
        .init();

    info!("Starting SAML Service Provider agent");

    let config = load_config(&args)?;

    info!(
        base_url = %config.base_url,
        sp_entity_id = %config.sp_entity_id(),
        idp_entity_id = %config.idp.entity_id,
        idp_slo = config.idp.slo_url.is_some(),
        disable_sso = config.disable_sso,
        debug = config.debug,
        "Configuration loaded"
    );

    let session_store = Arc::new(
        SessionStore::open(
            PathBuf::from(&config.session_store_path),
            config.session_ttl_secs,
        )
        .with_context(|| {
            format!(
                "Failed to initialize session store at {}",
                config.session_store_path
            )
        })?,
    );
    info!(path = %config.session_store_path, "Session store initialized");

    info!("Starting session cleanup task");
    let _cleanup_handle = spawn_cleanup_task(Arc::clone(&session_store), config.cleanup_interval_secs);

    let controller = Arc::new(SessionAuthController::new(config.authz.clone()));
    let provider = Arc::new(SamlProvider::new(config).context("Invalid SAML configuration")?);
    let app = SamlAuth::new(provider, session_store, controller).router();

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    info!(listen = %args.listen, "Serving SAML endpoints");

    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["saml-sp-agent", "--config", "/etc/saml-sp.json"]).unwrap();
        assert_eq!(args.listen, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(args.config, PathBuf::from("/etc/saml-sp.json"));
        assert!(!args.verbose);
    }

    #[test]
    fn test_load_config_applies_store_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "base_url": "https://reports.example.com",
                "idp": {{
                    "entity_id": "https://idp.example.com",
                    "sso_url": "https://idp.example.com/sso"
                }},
                "authz": {{ "mr_allowed_groups": "admins,auditors" }}
            }}"#
        )
        .unwrap();

        let args = Args::try_parse_from([
            "saml-sp-agent",
            "--config",
            file.path().to_str().unwrap(),
            "--session-store",
            "/tmp/override.redb",
            "-v",
        ])
        .unwrap();

        let config = load_config(&args).unwrap();
        assert_eq!(config.session_store_path, "/tmp/override.redb");
        assert_eq!(config.authz.allowed_groups(), vec!["admins", "auditors"]);
        assert!(args.verbose);
    }
}
