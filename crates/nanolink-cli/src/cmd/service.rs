//! Registering, looking up and probing services.

use crate::ui;
use nanolink_types::config::load_config;
use nanolink_wire::{fetch_registry, ServiceDescriptor, ServiceEndpoint, WireResult};
use std::future::Future;
use std::path::PathBuf;

fn block_on<F: Future>(fut: F) -> F::Output {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt.block_on(fut),
        Err(e) => {
            ui::fail(&format!("Failed to start async runtime: {e}"));
            std::process::exit(1);
        }
    }
}

pub fn cmd_register(
    registry: &str,
    name: &str,
    service_type: &str,
    host: &str,
    port: u16,
    expired: bool,
) {
    let mut descriptor = ServiceDescriptor::new(name, service_type, host, port);
    if expired {
        descriptor.mark_expired();
    }

    match block_on(descriptor.register_with(registry)) {
        Ok(()) => ui::done(&format!("Registered {descriptor} with {registry}")),
        Err(e) => {
            ui::fail_with("Registration failed", &e);
            std::process::exit(1);
        }
    }
}

pub fn cmd_lookup(registry: &str, service_type: Option<&str>, name: Option<&str>, json: bool) {
    let found = match block_on(lookup(registry, service_type, name)) {
        Ok(found) => found,
        Err(e) => {
            ui::fail_with("Lookup failed", &e);
            std::process::exit(1);
        }
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&found).unwrap_or_default()
        );
        return;
    }

    if found.is_empty() {
        ui::note("No matching services.");
        return;
    }
    ui::heading(&format!("Services at {registry}"));
    ui::service_table(&found);
}

async fn lookup(
    registry: &str,
    service_type: Option<&str>,
    name: Option<&str>,
) -> WireResult<Vec<ServiceDescriptor>> {
    let batch = fetch_registry(registry).await?;
    tracing::debug!(registry, services = batch.len(), "Fetched registry export");
    Ok(batch
        .services
        .into_iter()
        .filter(|d| service_type.map_or(true, |t| d.service_type == t))
        .filter(|d| name.map_or(true, |n| d.name == n))
        .collect())
}

pub fn cmd_probe(config: Option<PathBuf>, host: &str, port: u16) {
    let cfg = load_config(config.as_deref());
    let timeout = cfg.registry.probe_timeout();
    let target = ServiceDescriptor::new("probe", "probe", host, port);

    if block_on(target.probe(timeout)) {
        ui::done(&format!("{} is reachable", target.address()));
    } else {
        ui::fail(&format!(
            "{} did not accept a connection within {}ms",
            target.address(),
            timeout.as_millis()
        ));
        std::process::exit(1);
    }
}
