use std::path::Path;

use crate::output::print_json;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let platform = super::open_platform(root)?;
    let status = platform.status()?;
    if json {
        return print_json(&status);
    }
    println!("root:        {}", root.display());
    println!("ready:       {}", status.depth.ready);
    println!("leased:      {}", status.depth.leased);
    println!(
        "active key:  {}",
        status.active_kid.as_deref().unwrap_or("(none)")
    );
    println!("anchor day:  {}", status.anchor_day);
    Ok(())
}
