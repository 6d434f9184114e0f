use std::path::Path;

use anyhow::Context;
use veriq_core::receipt::{Receipt, VerificationReport};

use crate::output::{label, print_json};

pub fn show(root: &Path, cid: &str, json: bool) -> anyhow::Result<()> {
    let platform = super::open_platform(root)?;
    let receipt = platform.receipt(cid)?;
    if json {
        return print_json(&receipt);
    }
    let body = &receipt.body;
    println!("cid:       {}", receipt.cid);
    println!("work_id:   {}", body.work_id);
    println!("status:    {}", label(&body.status));
    println!("tenant:    {}", body.tenant);
    println!("topic:     {}", body.topic);
    println!("issued_at: {}", body.issued_at);
    println!("kid:       {}", receipt.signature.kid);
    if let Some(err) = &body.error {
        println!("error:     {} ({})", err.code, err.message);
    }
    Ok(())
}

/// Exits non-zero when the receipt does not verify.
pub fn run(root: &Path, cid: Option<&str>, file: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let platform = super::open_platform(root)?;
    let report = match (file, cid) {
        (Some(path), _) => {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let receipt: Receipt = serde_json::from_str(&data).context("invalid receipt document")?;
            platform.verify_receipt(&receipt)?
        }
        (None, Some(cid)) => platform.verify_cid(cid)?,
        (None, None) => anyhow::bail!("pass a receipt CID or --file"),
    };

    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    if !report.ok {
        anyhow::bail!("receipt {} failed verification", report.cid);
    }
    Ok(())
}

fn print_report(report: &VerificationReport) {
    let verdict = if report.ok { "OK" } else { "FAILED" };
    println!("{verdict}  {}", report.cid);
    if let Some(kid) = &report.kid {
        println!("  signed by {kid}");
    }
    if let Some(day) = &report.anchor_date {
        println!("  anchored {day}");
    }
    for issue in &report.issues {
        println!("  [{}] {}", label(&issue.kind), issue.message);
    }
}
