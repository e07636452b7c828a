use std::path::{Path, PathBuf};

/// Step to the first sibling of `directory` that does not exist yet, by
/// appending an ascending integer suffix (`out`, `out_1`, `out_2`, ...).
/// Returns `directory` unchanged if it is free.
pub fn next_available_dir(directory: &Path) -> PathBuf {
    if !directory.exists() {
        return directory.to_path_buf();
    }

    let name = directory
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = directory.parent().unwrap_or_else(|| Path::new(""));

    let mut i = 0;
    loop {
        i += 1;
        let candidate = parent.join(format!("{name}_{i}"));
        if !candidate.exists() {
            return candidate;
        }
    }
}
