use std::fmt::Display;
use std::fs;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use console::Style;

use crate::error::ClearError;

const ANSI_BLUE: Style = Style::new().blue();

pub fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Delete the output directory if it exists and recreate it empty.
pub fn clear_dest(dest: &Utf8Path) -> Result<(), ClearError> {
    let s = Instant::now();

    if fs::metadata(dest).is_ok() {
        fs::remove_dir_all(dest) //
            .map_err(ClearError::Remove)?;
    }

    fs::create_dir_all(dest) //
        .map_err(ClearError::Create)?;

    eprintln!("Cleaned the output directory {}", as_overhead(s));

    Ok(())
}

/// Collect every file under `dir`, recursively. Returns an empty list
/// when the directory doesn't exist yet.
pub fn walk_files(dir: &Utf8Path) -> std::io::Result<Vec<Utf8PathBuf>> {
    let mut acc = Vec::new();
    if !dir.is_dir() {
        return Ok(acc);
    }
    walk_rec(dir, &mut acc)?;
    acc.sort();
    Ok(acc)
}

fn walk_rec(dir: &Utf8Path, acc: &mut Vec<Utf8PathBuf>) -> std::io::Result<()> {
    for entry in dir.read_dir_utf8()? {
        let entry = entry?;
        let filetype = entry.file_type()?;
        if filetype.is_dir() {
            walk_rec(entry.path(), acc)?;
        } else {
            acc.push(entry.path().to_path_buf());
        }
    }
    Ok(())
}

/// Copy `file` (which lives under `src_root`) to the same relative
/// location under `dest_root`, creating directories as needed. Returns
/// the destination path.
pub fn copy_into(
    file: &Utf8Path,
    src_root: &Utf8Path,
    dest_root: &Utf8Path,
) -> std::io::Result<Utf8PathBuf> {
    let rel = file.strip_prefix(src_root).unwrap_or(file);
    let target = dest_root.join(rel);

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(file, &target)?;

    Ok(target)
}
