use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// A scheduler received a submission-parameter set it cannot render.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParameterError {
    #[error("submission params are missing the required {0:?}")]
    MissingRequired(Vec<&'static str>),
    #[error("submission params {params:?} are not supported by {scheduler}")]
    Unsupported {
        scheduler: &'static str,
        params: Vec<&'static str>,
    },
}

/// Canonical submission-parameter names, in header-line order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Param {
    JobName,
    Nodes,
    CpusPerNode,
    Walltime,
    OutLog,
    ErrLog,
    InitialDir,
    Queue,
    Qos,
    Account,
    Memory,
    Email,
    EmailEvents,
}

impl Param {
    pub fn label(self) -> &'static str {
        match self {
            Param::JobName => "job_name",
            Param::Nodes => "nodes",
            Param::CpusPerNode => "cpus_per_node",
            Param::Walltime => "walltime",
            Param::OutLog => "out_log",
            Param::ErrLog => "err_log",
            Param::InitialDir => "initial_dir",
            Param::Queue => "queue",
            Param::Qos => "qos",
            Param::Account => "account",
            Param::Memory => "memory",
            Param::Email => "email",
            Param::EmailEvents => "email_events",
        }
    }
}

/// The canonical parameter set handed to a scheduler's header renderer.
/// Keyed by [`Param`], so iteration order is canonical no matter the
/// insertion order and rendering stays byte-for-byte deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionParams(BTreeMap<Param, String>);

impl SubmissionParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, param: Param, value: impl ToString) {
        self.0.insert(param, value.to_string());
    }

    pub fn get(&self, param: Param) -> Option<&str> {
        self.0.get(&param).map(String::as_str)
    }

    pub fn contains(&self, param: Param) -> bool {
        self.0.contains_key(&param)
    }

    pub fn params(&self) -> impl Iterator<Item = Param> + '_ {
        self.0.keys().copied()
    }
}

/// Which queueing system a machine runs. Selects the static [`Scheduler`]
/// table used for header rendering and submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Slurm,
    Pbs,
    Loadleveller,
}

impl SchedulerKind {
    pub fn scheduler(self) -> &'static Scheduler {
        match self {
            SchedulerKind::Slurm => &SLURM,
            SchedulerKind::Pbs => &PBS,
            SchedulerKind::Loadleveller => &LOADLEVELLER,
        }
    }
}

/// One queueing system, as data: directive templates plus the handful of
/// strings that differ between systems. `{}` in a template is replaced by
/// the parameter value.
///
/// `joined` names parameters whose directives share one physical line (their
/// templates are concatenated without separators, ahead of the per-line
/// pass); `epilogue` is literal text appended after the header.
#[derive(Debug)]
pub struct Scheduler {
    pub name: &'static str,
    pub submit_command: &'static str,
    pub script_ext: &'static str,
    pub shebang: &'static str,
    pub default_email_events: &'static str,
    templates: &'static [(Param, &'static str)],
    required: &'static [Param],
    optional: &'static [Param],
    joined: &'static [Param],
    epilogue: &'static str,
    dependency: Option<(&'static str, &'static str)>,
}

impl Scheduler {
    pub fn supports(&self, param: Param) -> bool {
        self.required.contains(&param) || self.optional.contains(&param)
    }

    fn template(&self, param: Param) -> &'static str {
        self.templates
            .iter()
            .find(|(candidate, _)| *candidate == param)
            .map(|(_, template)| *template)
            .expect("scheduler table covers all required and optional params")
    }

    /// Render the submission header for `params`.
    ///
    /// All required parameters must be present and nothing outside the
    /// required and optional sets may appear. The output starts with the
    /// shebang and always ends with a trailing blank line.
    pub fn render(&self, params: &SubmissionParams) -> Result<String, ParameterError> {
        let missing = self
            .required
            .iter()
            .filter(|param| !params.contains(**param))
            .map(|param| param.label())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(ParameterError::MissingRequired(missing));
        }

        let unsupported = params
            .params()
            .filter(|param| !self.supports(*param))
            .map(Param::label)
            .collect::<Vec<_>>();
        if !unsupported.is_empty() {
            return Err(ParameterError::Unsupported {
                scheduler: self.name,
                params: unsupported,
            });
        }

        let mut lines = vec![self.shebang.to_owned()];

        if !self.joined.is_empty() {
            let joined = self
                .joined
                .iter()
                .filter_map(|param| {
                    params
                        .get(*param)
                        .map(|value| self.template(*param).replacen("{}", value, 1))
                })
                .collect::<String>();
            lines.push(joined);
        }

        for (param, template) in self.templates {
            if self.joined.contains(param) {
                continue;
            }
            if let Some(value) = params.get(*param) {
                lines.push(template.replacen("{}", value, 1));
            }
        }

        if !self.epilogue.is_empty() {
            lines.push(self.epilogue.to_owned());
        }

        // trailing blank line
        lines.push(String::new());
        Ok(lines.join("\n"))
    }

    /// Submission arguments that chain a job after `previous_job_id`,
    /// regardless of its exit status. Empty when the system has no such
    /// mechanism.
    pub fn dependency_args(&self, previous_job_id: &str) -> Vec<String> {
        match self.dependency {
            Some((flag, template)) => {
                vec![flag.to_owned(), template.replacen("{}", previous_job_id, 1)]
            }
            None => Vec::new(),
        }
    }
}

const COMMON_REQUIRED: &[Param] = &[
    Param::JobName,
    Param::Nodes,
    Param::CpusPerNode,
    Param::Walltime,
    Param::OutLog,
    Param::ErrLog,
];

static SLURM: Scheduler = Scheduler {
    name: "Slurm",
    submit_command: "sbatch",
    script_ext: ".slurm",
    shebang: "#!/bin/bash",
    default_email_events: "ALL",
    templates: &[
        (Param::JobName, "#SBATCH -J {}"),
        (Param::Nodes, "#SBATCH -N {}"),
        (Param::CpusPerNode, "#SBATCH --tasks-per-node={}"),
        (Param::Walltime, "#SBATCH -t {}"),
        (Param::OutLog, "#SBATCH -o {}"),
        (Param::ErrLog, "#SBATCH -e {}"),
        (Param::Queue, "#SBATCH -p {}"),
        (Param::Qos, "#SBATCH --qos={}"),
        (Param::Account, "#SBATCH -A {}"),
        (Param::Memory, "#SBATCH --mem={}gb"),
        (Param::Email, "#SBATCH --mail-user={}"),
        (Param::EmailEvents, "#SBATCH --mail-type={}"),
    ],
    required: COMMON_REQUIRED,
    optional: &[
        Param::Queue,
        Param::Qos,
        Param::Account,
        Param::Memory,
        Param::Email,
        Param::EmailEvents,
    ],
    joined: &[],
    epilogue: "",
    dependency: Some(("-d", "afterany:{}")),
};

static PBS: Scheduler = Scheduler {
    name: "PBS",
    submit_command: "qsub",
    script_ext: ".pbs",
    shebang: "#!/bin/bash",
    default_email_events: "abe",
    templates: &[
        (Param::JobName, "#PBS -N {}"),
        // nodes and ppn share one resource directive
        (Param::Nodes, "#PBS -l nodes={}"),
        (Param::CpusPerNode, ":ppn={}"),
        (Param::Walltime, "#PBS -l walltime={}"),
        (Param::OutLog, "#PBS -o {}"),
        (Param::ErrLog, "#PBS -e {}"),
        (Param::InitialDir, "#PBS -d {}"),
        (Param::Queue, "#PBS -q {}"),
        (Param::Memory, "#PBS -l pmem={}gb"),
        (Param::Email, "#PBS -M {}"),
        (Param::EmailEvents, "#PBS -m {}"),
    ],
    required: COMMON_REQUIRED,
    optional: &[
        Param::Queue,
        Param::Email,
        Param::EmailEvents,
        Param::Memory,
        Param::InitialDir,
    ],
    joined: &[Param::Nodes, Param::CpusPerNode],
    epilogue: "",
    dependency: Some(("-W", "depend=afterany:{}")),
};

static LOADLEVELLER: Scheduler = Scheduler {
    name: "Loadleveller",
    submit_command: "llsubmit",
    script_ext: ".ll",
    shebang: "#!/bin/bash",
    default_email_events: "complete",
    templates: &[
        (Param::JobName, "# @ job_name = {}"),
        (Param::Nodes, "# @ nodes = {}"),
        (Param::CpusPerNode, "# @ cpus_per_node = {}"),
        (Param::Walltime, "# @ walltime = {}"),
        (Param::OutLog, "# @ output = {}"),
        (Param::ErrLog, "# @ error = {}"),
        (Param::InitialDir, "# @ initialdir = {}"),
        (Param::Queue, "# @ class = {}"),
        (Param::Memory, "# @ requirements = (Memory >= {}gb)"),
        (Param::Email, "# @ notify_user = {}"),
        (Param::EmailEvents, "# @ notification = {}"),
    ],
    required: COMMON_REQUIRED,
    optional: &[
        Param::Queue,
        Param::Email,
        Param::EmailEvents,
        Param::Memory,
        Param::InitialDir,
    ],
    joined: &[],
    epilogue: "# @ queue",
    dependency: None,
};
