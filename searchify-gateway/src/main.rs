use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use searchify::access::key_digest;
use searchify::config::GatewayConfig;

#[derive(Parser, Debug)]
#[command(name = "searchify-gateway")]
#[command(version)]
#[command(about = "Searchify streaming gateway - citation-aware answer streaming over SSE")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve `POST /v1/stream` until Ctrl+C
    Serve(ServeArgs),
    /// Load and validate a configuration file, then exit
    CheckConfig(ConfigArgs),
    /// Print the SHA-256 digest to use as `key_sha256` for an API key
    HashKey(HashKeyArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Path to the TOML configuration; defaults apply when omitted
    #[arg(long, env = "SEARCHIFY_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `bind_addr` from the configuration
    #[arg(long, env = "SEARCHIFY_BIND_ADDR")]
    bind_addr: Option<String>,
}

#[derive(Parser, Debug)]
struct ConfigArgs {
    #[arg(long, env = "SEARCHIFY_CONFIG")]
    config: PathBuf,
}

#[derive(Parser, Debug)]
struct HashKeyArgs {
    key: String,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<GatewayConfig> {
    match path {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(GatewayConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("searchify=info".parse()?)
                .add_directive("searchify_gateway=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => {
            let mut config = load_config(args.config.as_ref())?;
            if let Some(bind_addr) = args.bind_addr {
                config.bind_addr = bind_addr;
            }
            config.validate()?;
            info!(
                bind_addr = %config.bind_addr,
                instances = config.instances.len(),
                api_keys = config.api_keys.len(),
                "Searchify gateway starting"
            );
            searchify::gateway::serve(config).await?;
        }
        Commands::CheckConfig(args) => {
            let config = load_config(Some(&args.config))?;
            println!(
                "Configuration OK: {} instance(s), {} API key(s), listening on {}",
                config.instances.len(),
                config.api_keys.len(),
                config.bind_addr
            );
        }
        Commands::HashKey(args) => {
            println!("{}", key_digest(&args.key));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_args_parse() {
        let cli = Cli::try_parse_from([
            "searchify-gateway",
            "serve",
            "--config",
            "gateway.toml",
            "--bind-addr",
            "0.0.0.0:9000",
        ])
        .expect("parse");
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.config, Some(PathBuf::from("gateway.toml")));
                assert_eq!(args.bind_addr.as_deref(), Some("0.0.0.0:9000"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_hash_key_requires_a_key() {
        assert!(Cli::try_parse_from(["searchify-gateway", "hash-key"]).is_err());
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = GatewayConfig::from_toml_str(include_str!("../gateway.example.toml"))
            .expect("example config parses");
        assert_eq!(config.instances[0].hash, "demo");

        let evidence = searchify::evidence::StaticEvidenceResolver::from_json_str(include_str!(
            "../evidence.example.json"
        ))
        .expect("example evidence parses");
        assert_eq!(evidence.record_count(), 2);
    }

    #[test]
    fn test_example_config_loads_from_any_working_directory() {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("gateway.example.toml");
        let config = load_config(Some(&path)).expect("example config loads");
        searchify::gateway::GatewayState::from_config(&config).expect("state builds");
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        assert!(load_config(Some(&PathBuf::from("/nonexistent/searchify.toml"))).is_err());
        assert!(load_config(None).is_ok());
    }
}
