use std::path::Path;

use clap::Subcommand;
use veriq_core::anchor::{parse_day, AnchorRecord};

use crate::output::{label, print_json};

#[derive(Subcommand)]
pub enum AnchorSubcommand {
    /// Show a day's anchor (provisional while the day is open)
    Show {
        /// Day as YYYY-MM-DD
        date: String,
    },

    /// Seal a day now
    Seal { date: String },

    /// Seal every closed day that is still open
    SealDue,

    /// Recompute a day's root from its receipts and compare
    Rebuild { date: String },

    /// Print the Merkle inclusion proof for a receipt
    Proof { cid: String },
}

pub fn run(root: &Path, subcmd: AnchorSubcommand, json: bool) -> anyhow::Result<()> {
    let platform = super::open_platform(root)?;
    match subcmd {
        AnchorSubcommand::Show { date } => {
            let anchor = platform.anchor(parse_day(&date)?)?;
            if json {
                return print_json(&anchor);
            }
            print_anchor(&anchor);
            for cid in &anchor.receipt_cids {
                println!("  {cid}");
            }
        }
        AnchorSubcommand::Seal { date } => {
            let anchor = platform.seal_anchor(parse_day(&date)?)?;
            if json {
                return print_json(&anchor);
            }
            print_anchor(&anchor);
        }
        AnchorSubcommand::SealDue => {
            let sealed = platform.seal_due()?;
            if json {
                return print_json(&sealed);
            }
            if sealed.is_empty() {
                println!("No days due.");
            }
            sealed.iter().for_each(print_anchor);
        }
        AnchorSubcommand::Rebuild { date } => {
            let report = platform.rebuild_anchor(parse_day(&date)?)?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "{} {} ({} receipts)",
                    report.date, report.rebuilt_root, report.receipt_count
                );
                match &report.stored_root {
                    Some(stored) if report.matches => println!("matches sealed root {stored}"),
                    Some(stored) => println!("MISMATCH: sealed root is {stored}"),
                    None => println!("day not sealed yet"),
                }
                for issue in &report.issues {
                    println!("  {issue}");
                }
            }
            if !report.matches {
                anyhow::bail!("anchor {} does not match its receipts", report.date);
            }
        }
        AnchorSubcommand::Proof { cid } => {
            let inclusion = platform.inclusion(&cid)?;
            if json {
                return print_json(&inclusion);
            }
            print_anchor(&inclusion.anchor);
            println!("leaf index {}", inclusion.proof.leaf_index);
            for step in &inclusion.proof.path {
                println!("  {:5} {}", label(&step.side), step.sibling);
            }
        }
    }
    Ok(())
}

fn print_anchor(anchor: &AnchorRecord) {
    let state = if anchor.sealed { "sealed" } else { "open" };
    println!(
        "{}  {}  {} receipts  {state}",
        anchor.date,
        anchor.merkle_root,
        anchor.receipt_cids.len()
    );
}
