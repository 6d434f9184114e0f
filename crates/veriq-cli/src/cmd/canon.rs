use std::io::Read;
use std::path::Path;

use anyhow::Context;
use veriq_core::canon::{self, CanonProfile};

use crate::output::print_json;

pub fn run(
    file: Option<&Path>,
    null_strip: bool,
    num_norm: bool,
    cid: bool,
    json: bool,
) -> anyhow::Result<()> {
    let text = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read stdin")?;
            buf
        }
    };
    let profile = CanonProfile {
        null_strip,
        num_norm,
    };
    let bytes = canon::canonicalize_str(&text, profile)?;
    let digest = canon::hash_hex(&bytes);

    if json {
        let canonical: serde_json::Value = serde_json::from_slice(&bytes)?;
        print_json(&serde_json::json!({
            "profile": profile,
            "cid": digest,
            "canonical": canonical,
        }))?;
    } else if cid {
        println!("{digest}");
    } else {
        println!("{}", String::from_utf8(bytes)?);
    }
    Ok(())
}
