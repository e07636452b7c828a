use crate::{
    config::{ConfigError, NotFoundError},
    util::next_available_dir,
};
use chrono::Local;
use ignore::WalkBuilder;
use std::{fs, io, path::{Path, PathBuf}, str::FromStr};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum RestartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    #[error("directory creation or backup copy failed")]
    Io(#[from] io::Error),
}

/// What to do with an existing output directory before a restart run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartCopyMode {
    /// No backup, run in place.
    None,
    /// Copy the tree to `<dir>_restart[_N]` and run in the copy; the
    /// original is the backup.
    #[default]
    New,
    /// Copy the tree to `<dir>_at_restart[_N]` and keep running in the
    /// original.
    StayOut,
    /// Copy the tree into `<dir>/backup_at_restart_<YYYYMMDD-HHMM>[_N]` and
    /// keep running in the original.
    StayIn,
}

impl FromStr for RestartCopyMode {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, ConfigError> {
        match text {
            "0" | "none" => Ok(Self::None),
            "1" | "new" => Ok(Self::New),
            "2" | "stay_out" => Ok(Self::StayOut),
            "3" | "stay_in" => Ok(Self::StayIn),
            _ => Err(ConfigError::InvalidRestartCopyMode(text.to_owned())),
        }
    }
}

/// Back up `output_dir` according to `mode` and return the directory the
/// restarted run should execute in. Dry runs resolve the same paths without
/// touching the filesystem.
pub fn copy_on_restart(
    output_dir: &Path,
    dry_run: bool,
    mode: RestartCopyMode,
) -> Result<PathBuf, RestartError> {
    match mode {
        RestartCopyMode::None => {
            info!("restarting in {} with no backup", output_dir.display());
            Ok(output_dir.to_path_buf())
        }
        RestartCopyMode::New => {
            let restart_dir = next_available_dir(&sibling(output_dir, "_restart"));
            info!(
                "restarting in {}, leaving a backup of the start files in {}",
                restart_dir.display(),
                output_dir.display()
            );
            if !dry_run {
                copy_tree_excluding_backups(output_dir, &restart_dir)?;
            }
            Ok(restart_dir)
        }
        RestartCopyMode::StayOut => {
            let backup_dir = next_available_dir(&sibling(output_dir, "_at_restart"));
            info!(
                "restarting in {}, copying the start files to {}",
                output_dir.display(),
                backup_dir.display()
            );
            if !dry_run {
                copy_tree_excluding_backups(output_dir, &backup_dir)?;
            }
            Ok(output_dir.to_path_buf())
        }
        RestartCopyMode::StayIn => {
            let stamp = Local::now().format("%Y%m%d-%H%M");
            let backup_dir =
                next_available_dir(&output_dir.join(format!("backup_at_restart_{stamp}")));
            info!(
                "restarting in {}, copying the start files to {}",
                output_dir.display(),
                backup_dir.display()
            );
            if !dry_run {
                copy_tree_excluding_backups(output_dir, &backup_dir)?;
            }
            Ok(output_dir.to_path_buf())
        }
    }
}

fn sibling(directory: &Path, suffix: &str) -> PathBuf {
    let mut name = directory
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(suffix);
    directory.with_file_name(name)
}

/// Mirror `src` into `dst`, skipping every entry whose name contains
/// `backup`. The skip is what keeps the stay-in mode from recursing into the
/// copy it is writing.
fn copy_tree_excluding_backups(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;

    let walk = WalkBuilder::new(src)
        .standard_filters(false)
        .filter_entry(|entry| {
            !entry
                .file_name()
                .to_string_lossy()
                .contains("backup")
        })
        .build();

    for entry in walk {
        let entry = entry.map_err(|error| io::Error::new(io::ErrorKind::Other, error))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .expect("walker yields paths under its root");
        if relative.as_os_str().is_empty() {
            continue;
        }

        let target = dst.join(relative);
        if entry.path().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}
