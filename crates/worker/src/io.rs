//! Local file I/O for work items

use crate::messages::Instance;
use batchgen_common::{BatchGenError, Result};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const INPUT_EXTENSION: &str = "jsonl";

fn jsonl_file_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some(INPUT_EXTENSION) {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Input files that have no output file of the same name yet, sorted by name
///
/// A missing output directory means nothing has been processed.
pub fn determine_remaining_files_to_process(input_dir: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
    let done: HashSet<String> = if output_dir.is_dir() {
        jsonl_file_names(output_dir)?.into_iter().collect()
    } else {
        HashSet::new()
    };

    let mut remaining: Vec<String> = jsonl_file_names(input_dir)?
        .into_iter()
        .filter(|name| !done.contains(name))
        .collect();
    remaining.sort();

    debug!(
        input_dir = %input_dir.display(),
        remaining = remaining.len(),
        already_done = done.len(),
        "Scanned for unprocessed files"
    );

    Ok(remaining.into_iter().map(|name| input_dir.join(name)).collect())
}

/// Parse every non-blank line of a JSONL file
pub fn load_instances(path: &Path) -> Result<Vec<Instance>> {
    let reader = BufReader::new(File::open(path)?);

    let mut instances = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let content = line.trim();
        if content.is_empty() {
            continue;
        }
        let instance = serde_json::from_str(content).map_err(|e| {
            BatchGenError::invalid_input(format!("{}:{}: {}", path.display(), number + 1, e))
        })?;
        instances.push(instance);
    }
    Ok(instances)
}

/// Write records to `output_dir/<input file name>` as newline-separated JSON
///
/// The file appears atomically: it is written under a temporary name and
/// renamed into place.
pub fn write_instances(records: &[Instance], input_path: &Path, output_dir: &Path) -> Result<PathBuf> {
    let file_name = input_path.file_name().ok_or_else(|| {
        BatchGenError::invalid_input(format!("{} has no file name", input_path.display()))
    })?;
    let destination = output_dir.join(file_name);

    fs::create_dir_all(output_dir)?;
    let mut staged = tempfile::NamedTempFile::new_in(output_dir)?;
    for (position, record) in records.iter().enumerate() {
        if position > 0 {
            staged.write_all(b"\n")?;
        }
        serde_json::to_writer(&mut staged, record)?;
    }
    staged.flush()?;
    staged.persist(&destination).map_err(|e| e.error)?;

    Ok(destination)
}
