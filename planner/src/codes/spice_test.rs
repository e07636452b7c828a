use super::spice::{Spice, SpiceOptions};
use crate::{
    codes::{CallParams, RestartMode},
    config::ConfigError,
    input::InputDeck,
    machine::Machine,
    restart::RestartCopyMode,
    scheduler::SchedulerKind,
};
use std::{fs, path::PathBuf};

fn options(version: u32) -> SpiceOptions {
    SpiceOptions {
        version,
        verbose: false,
        soft_restart: false,
        full_restart: false,
        time_limit: None,
    }
}

fn marconi_like() -> Machine {
    Machine {
        name: "skylake".into(),
        cpus_per_node: 48,
        memory_per_node: 182,
        max_nodes: 64,
        max_job_time: Some(24),
        scheduler: SchedulerKind::Slurm,
        modules: Vec::new(),
    }
}

fn call_params(cpus: u32) -> CallParams {
    CallParams {
        cpus_total: cpus,
        executable: PathBuf::from("/bins/spice.bin"),
        executable_dir: PathBuf::from("/bins"),
        output_dir: PathBuf::from("/scratch/sheath"),
        input_file: PathBuf::from("/scratch/sheath.inp"),
        node_distribution: None,
    }
}

#[test]
pub fn restart_flags_are_mutually_exclusive() {
    let conflicting = SpiceOptions {
        soft_restart: true,
        full_restart: true,
        ..options(2)
    };

    assert!(matches!(
        Spice.validate_options(&conflicting),
        Err(ConfigError::ConflictingRestartFlags)
    ));
}

#[test]
pub fn only_versions_two_and_three_are_accepted() {
    assert!(Spice.validate_options(&options(2)).is_ok());
    assert!(Spice.validate_options(&options(3)).is_ok());
    assert!(matches!(
        Spice.validate_options(&options(4)),
        Err(ConfigError::UnsupportedVersion(4))
    ));
}

#[test]
pub fn time_limit_must_be_positive() {
    let zero = SpiceOptions {
        time_limit: Some(0),
        ..options(2)
    };
    assert!(matches!(
        Spice.validate_options(&zero),
        Err(ConfigError::InvalidTimeLimit)
    ));

    let five = SpiceOptions {
        time_limit: Some(5),
        ..options(2)
    };
    assert!(Spice.validate_options(&five).is_ok());
}

#[test]
pub fn restart_mode_and_args_follow_the_flags() {
    let soft = SpiceOptions {
        soft_restart: true,
        ..options(2)
    };
    let full = SpiceOptions {
        full_restart: true,
        verbose: true,
        time_limit: Some(5),
        ..options(2)
    };

    assert_eq!(Spice.restart_mode(&options(2)), RestartMode::None);
    assert_eq!(Spice.restart_mode(&soft), RestartMode::Soft);
    assert_eq!(Spice.restart_mode(&full), RestartMode::Full);

    assert!(Spice.command_line_args(&options(2)).is_empty());
    assert_eq!(Spice.command_line_args(&soft), vec!["-r"]);
    assert_eq!(Spice.command_line_args(&full), vec!["-c", "-v", "-l 5"]);
}

#[test]
pub fn body_runs_mpirun_and_rotates_logs() {
    let body = Spice.render_body(&marconi_like(), &call_params(96), &options(2), false, true, true);

    assert!(body.contains("time mpirun -np 96 /bins/spice.bin"));
    assert!(body.contains("-o /scratch/sheath/sheath"));
    assert!(body.contains("-t /scratch/sheath/t-sheath"));
    assert!(body.contains("cat /scratch/sheath/log.out >> /scratch/sheath/log.ongoing.out"));
    assert!(body.contains("scancel $(cat /scratch/sheath/jobs.txt)"));
    // version 2 reads the first percentage column and runs no stitcher
    assert!(body.contains("awk '{print $1}'"));
    assert!(!body.contains("stitcher.bin"));
    // safe job time is injected as a spice time limit
    assert!(body.contains("-l 21"));
}

#[test]
pub fn version_three_adds_the_stitcher_and_shifts_the_log_column() {
    let body = Spice.render_body(&marconi_like(), &call_params(64), &options(3), false, true, true);

    assert!(body.contains("/bins/stitcher.bin -i /scratch/sheath.inp -t /scratch/sheath/t-sheath -n 64"));
    assert!(body.contains("awk '{print $2}'"));
}

#[test]
pub fn explicit_time_limit_overrides_the_safe_walltime() {
    let limited = SpiceOptions {
        time_limit: Some(5),
        ..options(2)
    };
    let body = Spice.render_body(&marconi_like(), &call_params(96), &limited, false, true, true);

    assert!(body.contains("-l 5"));
    assert!(!body.contains("-l 21"));
}

#[test]
pub fn chained_fresh_runs_continue_with_the_restart_flag() {
    let body = Spice.render_body(&marconi_like(), &call_params(96), &options(2), true, false, true);
    assert!(body.contains("spice.bin -c"));

    // an explicit restart already carries its flag, nothing is appended
    let soft = SpiceOptions {
        soft_restart: true,
        ..options(2)
    };
    let body = Spice.render_body(&marconi_like(), &call_params(96), &soft, true, false, true);
    assert!(body.contains("spice.bin -r"));
    assert!(!body.contains("-r -c"));
}

#[test]
pub fn node_distribution_switches_to_arbitrary_placement() {
    let mut call = call_params(96);
    call.node_distribution = Some("1,47,48".into());

    let body = Spice.render_body(&marconi_like(), &call, &options(2), false, false, true);

    assert!(body.contains("srun -n 96 -m arbitrary -w `/bins/arbitrary.pl 1,47,48`"));
    assert!(!body.contains("mpirun -np"));
}

#[test]
pub fn backup_flag_adds_the_full_directory_mirror() {
    let with_backup =
        Spice.render_body(&marconi_like(), &call_params(96), &options(2), false, false, true);
    let without_backup =
        Spice.render_body(&marconi_like(), &call_params(96), &options(2), false, false, false);

    assert_eq!(with_backup.matches("rsync -azvp").count(), 3);
    assert_eq!(without_backup.matches("rsync -azvp").count(), 2);
}

const VALID_V3_DECK: &str = "\
[geom]
Lx = 64
Ly = 64
Lz = 128
decompose_x = 8
decompose_y = 8

[num_spec]
no_species = 2

[specie0]
name = electrons
mpi_rank = -1

[specie1]
name = deuterium
mpi_rank = -1
";

#[test]
pub fn valid_version_three_decks_pass() {
    let deck: InputDeck = VALID_V3_DECK.parse().unwrap();
    assert!(Spice.verify_input_deck(&deck, &options(3), 64).is_ok());
}

#[test]
pub fn version_two_skips_the_deck_checks() {
    let deck: InputDeck = "[geom]\nLx = 63\n".parse().unwrap();
    assert!(Spice.verify_input_deck(&deck, &options(2), 64).is_ok());
}

#[test]
pub fn window_sizes_must_be_powers_of_two() {
    let deck: InputDeck = VALID_V3_DECK.replace("Lx = 64", "Lx = 63").parse().unwrap();

    assert!(matches!(
        Spice.verify_input_deck(&deck, &options(3), 64),
        Err(ConfigError::WindowNotPowerOfTwo {
            dimension: "Lx",
            size: 63,
        })
    ));
}

#[test]
pub fn decomposition_must_match_the_cpu_request() {
    let deck: InputDeck = VALID_V3_DECK.parse().unwrap();

    assert!(matches!(
        Spice.verify_input_deck(&deck, &options(3), 96),
        Err(ConfigError::DecompositionCpuMismatch { areas: 64, cpus: 96 })
    ));

    let lopsided: InputDeck = VALID_V3_DECK
        .replace("decompose_x = 8", "decompose_x = 3")
        .parse()
        .unwrap();
    assert!(matches!(
        Spice.verify_input_deck(&lopsided, &options(3), 24),
        Err(ConfigError::DecompositionNotPowerOfTwo { areas: 24 })
    ));
}

#[test]
pub fn species_must_leave_their_rank_unassigned() {
    let deck: InputDeck = VALID_V3_DECK
        .replace("name = deuterium\nmpi_rank = -1", "name = deuterium\nmpi_rank = 3")
        .parse()
        .unwrap();

    assert!(matches!(
        Spice.verify_input_deck(&deck, &options(3), 64),
        Err(ConfigError::SpeciesRankAssigned { species }) if species == "deuterium"
    ));
}

#[test]
pub fn output_dir_fingerprint_requires_the_mat_triplet() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path();

    // one result file, one live t-file, one numbered t-file
    fs::write(dir.join("sheath.mat"), "").unwrap();
    fs::write(dir.join("t-sheath.mat"), "").unwrap();
    fs::write(dir.join("t-sheath01.mat"), "").unwrap();
    assert!(Spice.is_own_output_dir(dir));

    // 2d slices and extra t-numbering don't break the fingerprint
    fs::write(dir.join("sheath.2d.mat"), "").unwrap();
    fs::write(dir.join("t-sheath02.mat"), "").unwrap();
    assert!(Spice.is_own_output_dir(dir));

    // a second result file does
    fs::write(dir.join("other.mat"), "").unwrap();
    assert!(!Spice.is_own_output_dir(dir));
}

#[test]
pub fn fingerprint_rejects_empty_and_missing_directories() {
    let root = tempfile::tempdir().unwrap();
    assert!(!Spice.is_own_output_dir(root.path()));
    assert!(!Spice.is_own_output_dir(&root.path().join("missing")));

    // a lone t-file isn't enough
    fs::write(root.path().join("t-sheath.mat"), "").unwrap();
    assert!(!Spice.is_own_output_dir(root.path()));
}

#[test]
pub fn fresh_runs_step_aside_from_existing_directories() {
    let root = tempfile::tempdir().unwrap();
    let target = root.path().join("out");
    fs::create_dir(&target).unwrap();

    let resolved = Spice
        .directory_io(&target, &options(2), false, RestartCopyMode::New)
        .unwrap();

    assert_eq!(resolved, root.path().join("out_1"));
    assert!(resolved.is_dir());
}

#[test]
pub fn fresh_dry_runs_create_nothing() {
    let root = tempfile::tempdir().unwrap();
    let target = root.path().join("out");

    let resolved = Spice
        .directory_io(&target, &options(2), true, RestartCopyMode::New)
        .unwrap();

    assert_eq!(resolved, target);
    assert!(!resolved.exists());
}

#[test]
pub fn restarts_need_an_existing_directory() {
    let root = tempfile::tempdir().unwrap();
    let soft = SpiceOptions {
        soft_restart: true,
        ..options(2)
    };

    let missing = Spice.directory_io(
        &root.path().join("missing"),
        &soft,
        false,
        RestartCopyMode::New,
    );
    assert!(missing.is_err());

    let file = root.path().join("not_a_dir");
    fs::write(&file, "").unwrap();
    let not_a_dir = Spice.directory_io(&file, &soft, false, RestartCopyMode::New);
    assert!(not_a_dir.is_err());
}

#[test]
pub fn restarting_copies_the_run_directory() {
    let root = tempfile::tempdir().unwrap();
    let target = root.path().join("out");
    fs::create_dir(&target).unwrap();
    fs::write(target.join("sheath.mat"), "").unwrap();
    let soft = SpiceOptions {
        soft_restart: true,
        ..options(2)
    };

    let resolved = Spice
        .directory_io(&target, &soft, false, RestartCopyMode::New)
        .unwrap();

    assert_eq!(resolved, root.path().join("out_restart"));
    assert!(resolved.join("sheath.mat").is_file());
}

#[test]
pub fn copying_the_executable_repoints_the_call() {
    let root = tempfile::tempdir().unwrap();
    let exe = root.path().join("spice.bin");
    fs::write(&exe, "binary").unwrap();
    let out = root.path().join("out");
    fs::create_dir(&out).unwrap();

    let mut call = call_params(96);
    call.executable = exe;
    Spice.copy_executable(&out, &mut call, false).unwrap();

    assert_eq!(call.executable, out.join("localbin/spice.bin"));
    assert!(call.executable.is_file());
}

#[test]
pub fn scanning_parameters_come_from_the_deck() {
    let root = tempfile::tempdir().unwrap();
    let input = root.path().join("sheath.inp");
    fs::write(&input, "[plasma]\ntemp = [1.0, 2.0]\ndensity = 1e18\n").unwrap();

    assert!(Spice.is_parameter_scan(&input).unwrap());
    let (params, deck) = Spice.scanning_parameters(&input).unwrap();
    assert_eq!(params.len(), 1);
    assert_eq!(params[0].parameter, "temp");
    assert_eq!(deck.get("plasma", "density"), Some("1e18"));
}
