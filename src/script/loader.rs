//! Named-script loading.
//!
//! Resolves a logical script name to a file, strips comments and blank
//! lines, and memoizes the result in a process-wide cache so each script
//! is read once.
//!
//! A name is tried literally, then under `data/`, then under each
//! colon-separated directory in the `RESERVOIR_SCRIPT_PATH` environment
//! variable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::constants::SCRIPT_PATH_ENV;
use crate::error::{Error, Result};

static SCRIPT_CACHE: Lazy<Mutex<HashMap<String, String>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Load a script by name.
///
/// # Errors
/// [`Error::ScriptNotFound`] when no candidate location has the file;
/// [`Error::Io`] when the file exists but cannot be read.
pub fn load(name: &str) -> Result<String> {
    if let Some(script) = SCRIPT_CACHE.lock().unwrap().get(name) {
        return Ok(script.clone());
    }

    let path = find(name).ok_or_else(|| Error::ScriptNotFound(name.to_string()))?;
    tracing::debug!(name, path = %path.display(), "Loading script");

    let raw = std::fs::read_to_string(&path)?;
    let script = strip(&raw);

    SCRIPT_CACHE
        .lock()
        .unwrap()
        .insert(name.to_string(), script.clone());
    Ok(script)
}

fn find(name: &str) -> Option<PathBuf> {
    let literal = Path::new(name);
    if literal.is_file() {
        return Some(literal.to_path_buf());
    }

    let under_data = Path::new("data").join(name);
    if under_data.is_file() {
        return Some(under_data);
    }

    if let Ok(search_path) = std::env::var(SCRIPT_PATH_ENV) {
        for dir in search_path.split(':').filter(|d| !d.is_empty()) {
            let candidate = Path::new(dir).join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    None
}

// Trim every line, drop blanks and `#` comments, join the rest.
fn strip(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n")
}
