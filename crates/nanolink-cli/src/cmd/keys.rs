//! Key generation.

use crate::ui;
use nanolink_wire::SessionKeys;

pub fn cmd_keygen(toml: bool) {
    let keys = SessionKeys::generate();
    let encrypt = keys.encrypt.to_base64();
    let auth = keys.auth.to_base64();

    if toml {
        println!("[keys]");
        println!("encrypt_key = \"{encrypt}\"");
        println!("auth_key = \"{auth}\"");
        return;
    }

    ui::heading("New session keys");
    ui::field("encrypt", &encrypt);
    ui::field("auth", &auth);
    println!();
    ui::note("Both peers need the same pair. Use --toml for a config snippet.");
}
