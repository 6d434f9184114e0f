use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Subcommand;
use veriq_core::intent::SubmitRequest;
use veriq_core::types::WorkUnit;
use veriq_core::worker::Worker;

use crate::output::{label, print_json, print_table};

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum WorkSubcommand {
    /// Submit a work unit from a JSON file
    Submit {
        file: PathBuf,
        /// Confirmation phrase for dual-control topics
        #[arg(long)]
        confirm: Option<String>,
    },

    /// Show a queued work record
    Show { work_id: String },

    /// List the event log of a work item
    Events {
        work_id: String,
        /// Only events after this sequence number
        #[arg(long)]
        after: Option<u32>,
    },
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: WorkSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        WorkSubcommand::Submit { file, confirm } => submit(root, &file, confirm, json),
        WorkSubcommand::Show { work_id } => show(root, &work_id, json),
        WorkSubcommand::Events { work_id, after } => events(root, &work_id, after, json),
    }
}

fn submit(root: &Path, file: &Path, confirm: Option<String>, json: bool) -> anyhow::Result<()> {
    let data = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let work: WorkUnit = serde_json::from_str(&data).context("invalid work unit")?;
    let platform = super::open_platform(root)?;
    let resp = platform.submit(&SubmitRequest {
        work,
        confirm_phrase: confirm,
        requested_route: None,
        estimates: Default::default(),
    })?;

    if json {
        return print_json(&resp);
    }
    if resp.duplicate {
        println!("Duplicate of {} ({})", resp.work_id, label(&resp.status));
    } else {
        println!("Accepted {}", resp.work_id);
    }
    println!("plan_hash: {}", resp.plan_hash);
    if let Some(cid) = &resp.receipt_cid {
        println!("receipt:   {cid}");
    }
    Ok(())
}

fn show(root: &Path, work_id: &str, json: bool) -> anyhow::Result<()> {
    let platform = super::open_platform(root)?;
    let work = platform.work(work_id)?;
    if json {
        return print_json(&work);
    }
    println!("work_id:    {}", work.work_id);
    println!("tenant:     {}", work.work.tenant);
    println!("topic:      {}", work.work.topic);
    println!(
        "schema:     {}@{}",
        work.work.schema_id, work.work.schema_version
    );
    println!("state:      {}", label(&work.state));
    println!("reassigns:  {}", work.reassign_count);
    if let Some(lease) = &work.lease {
        println!("leased by:  {} until {}", lease.worker_id, lease.expires_at);
    }
    if let Some(cid) = &work.receipt_cid {
        println!("receipt:    {cid}");
    }
    Ok(())
}

fn events(root: &Path, work_id: &str, after: Option<u32>, json: bool) -> anyhow::Result<()> {
    let platform = super::open_platform(root)?;
    let events = platform.events(work_id, after)?;
    if json {
        return print_json(&events);
    }
    let rows = events
        .iter()
        .map(|e| {
            vec![
                e.seq.to_string(),
                e.at.to_rfc3339(),
                e.name().to_string(),
            ]
        })
        .collect();
    print_table(&["SEQ", "AT", "EVENT"], rows);
    Ok(())
}

/// Run the built-in worker until nothing is ready (or `limit` receipts).
pub fn drain(root: &Path, limit: Option<usize>, json: bool) -> anyhow::Result<()> {
    let platform = super::open_platform(root)?;
    let worker = Worker::builtin(platform.config());
    let mut receipts = Vec::new();
    loop {
        let batch = worker.run_once(&platform)?;
        if batch.is_empty() {
            break;
        }
        receipts.extend(batch);
        if limit.is_some_and(|n| receipts.len() >= n) {
            break;
        }
    }

    if json {
        return print_json(&receipts);
    }
    if receipts.is_empty() {
        println!("Nothing ready.");
        return Ok(());
    }
    let rows = receipts
        .iter()
        .map(|r| {
            vec![
                r.body.work_id.clone(),
                label(&r.body.status),
                r.cid.clone(),
            ]
        })
        .collect();
    print_table(&["WORK", "STATUS", "RECEIPT"], rows);
    Ok(())
}

pub fn sweep(root: &Path, json: bool) -> anyhow::Result<()> {
    let platform = super::open_platform(root)?;
    let report = platform.sweep()?;
    if json {
        return print_json(&report);
    }
    println!(
        "reassigned {}, abandoned {}",
        report.reassigned.len(),
        report.abandoned.len()
    );
    Ok(())
}
