use std::path::Path;

use anyhow::Result;
use overdrive_core::patch::table::builtin_signatures;
use overdrive_core::resolver::save_signatures;
use tracing::info;

pub fn run(output: Option<&Path>) -> Result<()> {
    let signatures = builtin_signatures();
    match output {
        Some(path) => {
            save_signatures(path, &signatures)?;
            info!(
                "Wrote {} signatures to {}",
                signatures.entries.len(),
                path.display()
            );
        }
        None => println!("{}", serde_json::to_string_pretty(&signatures)?),
    }
    Ok(())
}
