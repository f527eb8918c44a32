//! Terminal output for nanolink commands.
//!
//! Results go to stdout, failures to stderr. Colour follows `colored`'s
//! detection, so piping or `NO_COLOR` yields plain text.

use colored::Colorize;
use nanolink_types::{ErrorKind, ServiceDescriptor, WireError};

/// A completed action.
pub fn done(msg: &str) {
    println!("  {} {}", "ok".bright_green().bold(), msg);
}

/// A failed action with no error value to explain it.
pub fn fail(msg: &str) {
    eprintln!("  {} {}", "failed".bright_red().bold(), msg.bright_red());
}

/// A failed action plus the remedy that matches the error's class.
pub fn fail_with(action: &str, err: &WireError) {
    fail(&format!("{action}: {err}"));
    note(fix_for(err.kind()));
}

/// What a user can do about an error of `kind`.
pub fn fix_for(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Transport => "check the host:port and that the other side is running",
        ErrorKind::Protocol => "both ends must use the same length width and frame limit",
        ErrorKind::Authentication => "both ends need the same key pair (see `nanolink keygen`)",
        ErrorKind::Encoding => "both ends must agree on the message type",
        ErrorKind::Configuration => "fix the value in the config file or on the command line",
        ErrorKind::Shutdown => "the registry is stopping; retry against a running one",
    }
}

pub fn heading(title: &str) {
    println!("  {}", title.bold().underline());
}

/// `label` padded to a column, then `value`.
pub fn field(label: &str, value: &str) {
    println!("    {:<10}{}", format!("{label}:"), value);
}

/// Secondary guidance, dimmed.
pub fn note(msg: &str) {
    println!("    {}", msg.dimmed());
}

/// Header plus one row per descriptor.
pub fn service_table(services: &[ServiceDescriptor]) {
    println!(
        "    {}",
        format!("{:<20} {:<14} {:<24} {}", "NAME", "TYPE", "ADDRESS", "STATE").dimmed()
    );
    for d in services {
        println!("    {}", format_service_row(d));
    }
}

/// One descriptor as a table row. Padding is applied before colouring so
/// columns line up with and without escapes.
pub fn format_service_row(d: &ServiceDescriptor) -> String {
    let state = if d.is_expired() {
        "expired".bright_yellow()
    } else {
        "live".bright_green()
    };
    format!(
        "{:<20} {} {:<24} {}",
        d.name,
        format!("{:<14}", d.service_type).dimmed(),
        d.address(),
        state
    )
}
