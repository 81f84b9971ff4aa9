use std::path::Path;

use droidstrap::{patch::OffsetTable, PlatformVersion};

pub fn run(file: Option<&Path>, api_level: Option<&str>) -> anyhow::Result<()> {
    let table = match file {
        Some(path) => OffsetTable::from_file(path)?,
        None => OffsetTable::builtin()?,
    };

    match api_level {
        Some(level) => {
            let version = PlatformVersion::from_api_level(level)?;
            let entry = table.lookup(&version)?;
            println!("{}", serde_json::to_string_pretty(entry)?);
        }
        None => println!("{}", table.to_json()?),
    }

    Ok(())
}
