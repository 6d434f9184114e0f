use std::path::Path;

use clap::Subcommand;
use veriq_core::keyring::KeyInfo;

use crate::output::{label, print_json, print_table};

#[derive(Subcommand)]
pub enum KeysSubcommand {
    /// List every signing key
    List,

    /// Retire the active key and generate a new one
    Rotate,

    /// Revoke a key; receipts it signed stop verifying
    Revoke { kid: String },
}

pub fn run(root: &Path, subcmd: KeysSubcommand, json: bool) -> anyhow::Result<()> {
    let platform = super::open_platform(root)?;
    match subcmd {
        KeysSubcommand::List => {
            let keys = platform.keys()?;
            if json {
                return print_json(&keys);
            }
            print_keys(&keys);
        }
        KeysSubcommand::Rotate => {
            let key = platform.rotate_key()?;
            if json {
                return print_json(&key);
            }
            println!("Active key is now {}", key.kid);
        }
        KeysSubcommand::Revoke { kid } => {
            let key = platform.revoke_key(&kid)?;
            if json {
                return print_json(&key);
            }
            println!("Revoked {}", key.kid);
        }
    }
    Ok(())
}

fn print_keys(keys: &[KeyInfo]) {
    let rows = keys
        .iter()
        .map(|k| {
            vec![
                k.kid.clone(),
                label(&k.status),
                k.created_at.format("%Y-%m-%d %H:%M").to_string(),
                k.public_key.clone(),
            ]
        })
        .collect();
    print_table(&["KID", "STATUS", "CREATED", "PUBLIC KEY"], rows);
}
