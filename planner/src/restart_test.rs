use crate::restart::{copy_on_restart, RestartCopyMode};
use std::{fs, path::Path};

/// A plausible run directory: results, logs, a nested folder and an old
/// backup that must never travel with a copy.
fn populate_run_dir(dir: &Path) {
    fs::create_dir_all(dir.join("localbin")).unwrap();
    fs::write(dir.join("sheath.mat"), "results").unwrap();
    fs::write(dir.join("t-sheath.mat"), "t-data").unwrap();
    fs::write(dir.join("localbin/spice.bin"), "binary").unwrap();
    fs::create_dir_all(dir.join("backup_20200101-0000")).unwrap();
    fs::write(dir.join("backup_20200101-0000/old.mat"), "stale").unwrap();
}

fn assert_copied_without_backups(copy: &Path) {
    assert!(copy.join("sheath.mat").is_file());
    assert!(copy.join("t-sheath.mat").is_file());
    assert!(copy.join("localbin/spice.bin").is_file());

    let backups = fs::read_dir(copy)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().contains("backup"))
        .count();
    assert_eq!(backups, 0);
}

#[test]
pub fn mode_none_runs_in_place_without_copying() {
    let root = tempfile::tempdir().unwrap();
    let run_dir = root.path().join("out");
    populate_run_dir(&run_dir);

    let resolved = copy_on_restart(&run_dir, false, RestartCopyMode::None).unwrap();

    assert_eq!(resolved, run_dir);
    assert_eq!(fs::read_dir(root.path()).unwrap().count(), 1);
}

#[test]
pub fn mode_new_runs_in_a_numbered_copy() {
    let root = tempfile::tempdir().unwrap();
    let run_dir = root.path().join("out");
    populate_run_dir(&run_dir);

    let first = copy_on_restart(&run_dir, false, RestartCopyMode::New).unwrap();
    assert_eq!(first, root.path().join("out_restart"));
    assert_copied_without_backups(&first);

    // the original is left untouched as the backup
    assert!(run_dir.join("sheath.mat").is_file());

    // a second restart picks the next sibling instead of colliding
    let second = copy_on_restart(&run_dir, false, RestartCopyMode::New).unwrap();
    assert_eq!(second, root.path().join("out_restart_1"));
    assert_copied_without_backups(&second);
}

#[test]
pub fn mode_stay_out_backs_up_and_runs_in_the_original() {
    let root = tempfile::tempdir().unwrap();
    let run_dir = root.path().join("out");
    populate_run_dir(&run_dir);

    let resolved = copy_on_restart(&run_dir, false, RestartCopyMode::StayOut).unwrap();

    assert_eq!(resolved, run_dir);
    assert_copied_without_backups(&root.path().join("out_at_restart"));
}

#[test]
pub fn mode_stay_in_backs_up_into_a_timestamped_subdirectory() {
    let root = tempfile::tempdir().unwrap();
    let run_dir = root.path().join("out");
    populate_run_dir(&run_dir);

    let resolved = copy_on_restart(&run_dir, false, RestartCopyMode::StayIn).unwrap();
    assert_eq!(resolved, run_dir);

    let backup = fs::read_dir(&run_dir)
        .unwrap()
        .filter_map(Result::ok)
        .find(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("backup_at_restart_")
        })
        .expect("a timestamped backup directory");

    // the backup holds the run files, but not the old backup and not itself
    assert_copied_without_backups(&backup.path());
}

#[test]
pub fn dry_runs_resolve_paths_without_copying() {
    let root = tempfile::tempdir().unwrap();
    let run_dir = root.path().join("out");
    populate_run_dir(&run_dir);

    let resolved = copy_on_restart(&run_dir, true, RestartCopyMode::New).unwrap();

    assert_eq!(resolved, root.path().join("out_restart"));
    assert!(!resolved.exists());
}

#[test]
pub fn copy_modes_parse_numbers_and_names() {
    assert_eq!("0".parse::<RestartCopyMode>().unwrap(), RestartCopyMode::None);
    assert_eq!("new".parse::<RestartCopyMode>().unwrap(), RestartCopyMode::New);
    assert_eq!(
        "2".parse::<RestartCopyMode>().unwrap(),
        RestartCopyMode::StayOut
    );
    assert_eq!(
        "stay_in".parse::<RestartCopyMode>().unwrap(),
        RestartCopyMode::StayIn
    );
    assert!("4".parse::<RestartCopyMode>().is_err());
}
