//! Running a discovery registry in the foreground.

use crate::ui;
use nanolink_types::config::load_config;
use nanolink_wire::DiscoveryRegistry;
use std::path::PathBuf;

pub fn cmd_registry(config: Option<PathBuf>, listen: Option<String>) {
    let mut cfg = load_config(config.as_deref());
    if let Some(addr) = listen {
        match addr.parse() {
            Ok(addr) => cfg.registry.listen_addr = addr,
            Err(e) => {
                ui::fail(&format!("Invalid listen address '{addr}': {e}"));
                ui::note("use host:port, e.g. 0.0.0.0:4345");
                std::process::exit(1);
            }
        }
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            ui::fail(&format!("Failed to start async runtime: {e}"));
            std::process::exit(1);
        }
    };
    rt.block_on(async {
        let sweep = cfg.registry.sweep_interval();
        let registry = match DiscoveryRegistry::start(cfg.registry).await {
            Ok(r) => r,
            Err(e) => {
                ui::fail_with("Could not start registry", &e);
                ui::note("pick a free port with --listen");
                std::process::exit(1);
            }
        };

        ui::done("Discovery registry running");
        ui::field("listen", &registry.local_addr().to_string());
        ui::field("sweep", &format!("every {}s", sweep.as_secs_f32()));
        ui::note("Press Ctrl+C to stop the registry");

        if let Err(e) = tokio::signal::ctrl_c().await {
            ui::fail(&format!("Failed to listen for Ctrl+C: {e}"));
        }

        registry.shutdown().await;
        ui::done("Registry stopped");
    });
}
