//! nanolink CLI: run a discovery registry, manage keys, register and find services.

mod cli;
mod cmd;
mod ui;

use crate::cli::*;
use clap::Parser;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    match cli.command {
        Commands::Registry { listen } => cmd::registry::cmd_registry(cli.config, listen),
        Commands::Keygen { toml } => cmd::keys::cmd_keygen(toml),
        Commands::Register {
            registry,
            name,
            service_type,
            host,
            port,
            expired,
        } => cmd::service::cmd_register(&registry, &name, &service_type, &host, port, expired),
        Commands::Lookup {
            registry,
            service_type,
            name,
            json,
        } => cmd::service::cmd_lookup(&registry, service_type.as_deref(), name.as_deref(), json),
        Commands::Probe { host, port } => cmd::service::cmd_probe(cli.config, &host, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_register() {
        let cli = Cli::try_parse_from([
            "nanolink",
            "register",
            "--registry",
            "127.0.0.1:4345",
            "--name",
            "svc1",
            "--type",
            "T",
            "--host",
            "localhost",
            "--port",
            "5555",
        ])
        .unwrap();
        match cli.command {
            Commands::Register {
                name,
                service_type,
                port,
                expired,
                ..
            } => {
                assert_eq!(name, "svc1");
                assert_eq!(service_type, "T");
                assert_eq!(port, 5555);
                assert!(!expired);
            }
            _ => panic!("expected register"),
        }
    }

    #[test]
    fn test_lookup_type_and_name_conflict() {
        let parsed = Cli::try_parse_from([
            "nanolink", "lookup", "--registry", "r:1", "--type", "T", "--name", "n",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["nanolink", "keygen", "--config", "/tmp/x.toml"]).unwrap();
        assert_eq!(cli.config.unwrap().to_str(), Some("/tmp/x.toml"));
    }
}
