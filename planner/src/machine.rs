use crate::{config::ConfigError, scheduler::SchedulerKind};
use std::{collections::BTreeMap, fmt, str::FromStr};
use thiserror::Error;
use tracing::warn;

/// A machine with no maximum job time was asked for a safe-time calculation.
/// Recoverable: the caller can simply not request a safe time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("machine '{machine}' has no maximum job time, cannot derive a safe walltime")]
pub struct UndefinedCapacity {
    pub machine: String,
}

/// A requested job duration, held in seconds.
///
/// Config files may give this as `"H:MM:SS"`, `"H:MM"` or a bare number of
/// hours; raw seconds enter through [`Walltime::from_secs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Walltime(u64);

impl Walltime {
    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    pub fn from_hours(hours: u64) -> Self {
        Self(hours * 3600)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }
}

impl FromStr for Walltime {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidWalltime(text.to_owned());
        let fields = text
            .split(':')
            .map(|field| field.trim().parse::<u64>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;

        match fields[..] {
            [hours] => Ok(Self::from_hours(hours)),
            [hours, minutes] if minutes < 60 => Ok(Self(hours * 3600 + minutes * 60)),
            [hours, minutes, seconds] if minutes < 60 && seconds < 60 => {
                Ok(Self(hours * 3600 + minutes * 60 + seconds))
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Walltime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{:02}:{:02}",
            self.0 / 3600,
            self.0 % 3600 / 60,
            self.0 % 60
        )
    }
}

/// Hard limits of one batch machine, plus the scheduler running on it and the
/// environment modules a job script should load.
#[derive(Debug, Clone)]
pub struct Machine {
    pub name: String,
    pub cpus_per_node: u32,
    pub memory_per_node: u32,
    pub max_nodes: u32,
    /// Longest single job the queue accepts, in hours. `None` means the
    /// machine places no upper bound.
    pub max_job_time: Option<u32>,
    pub scheduler: SchedulerKind,
    pub modules: Vec<String>,
}

impl Machine {
    /// Map a requested cpu count onto a `(nodes, cpus_per_node)` layout.
    ///
    /// Without an explicit node count the smallest node count that fits is
    /// chosen; either way the cpus must split evenly across the nodes.
    pub fn resolve_layout(
        &self,
        total_cpus: u32,
        explicit_nodes: Option<u32>,
    ) -> Result<(u32, u32), ConfigError> {
        if total_cpus == 0 {
            return Err(ConfigError::NoCpusRequested);
        }

        let nodes = match explicit_nodes {
            Some(0) => return Err(ConfigError::ZeroNodes),
            Some(nodes) => nodes,
            None => total_cpus.div_ceil(self.cpus_per_node),
        };

        if total_cpus % nodes != 0 {
            return Err(ConfigError::UnevenCpuSplit {
                cpus: total_cpus,
                nodes,
            });
        }
        let cpus_per_node = total_cpus / nodes;

        if cpus_per_node > self.cpus_per_node {
            return Err(ConfigError::NodeOversubscribed {
                cpus_per_node,
                max: self.cpus_per_node,
                machine: self.name.clone(),
            });
        }
        if cpus_per_node < self.cpus_per_node {
            warn!(
                "inefficient number of processors chosen - only {cpus_per_node} of the \
                 {} cpus on each node will be used, but all occupied nodes are charged",
                self.cpus_per_node
            );
        }

        if nodes > self.max_nodes {
            return Err(ConfigError::TooManyNodes {
                nodes,
                max: self.max_nodes,
                machine: self.name.clone(),
            });
        }
        if nodes == self.max_nodes {
            warn!(
                "using the maximum acceptable number of nodes on {}; the job will queue \
                 behind any of your currently running jobs",
                self.name
            );
        }

        Ok((nodes, cpus_per_node))
    }

    /// 90% of the maximum job time, floored to whole hours, leaving headroom
    /// for I/O before the queue kills the job. A 1-hour machine keeps its
    /// full hour.
    pub fn safe_walltime_hours(&self) -> Result<u32, UndefinedCapacity> {
        let max = self.max_job_time.ok_or_else(|| UndefinedCapacity {
            machine: self.name.clone(),
        })?;
        Ok(if max == 1 { 1 } else { max * 9 / 10 })
    }

    /// How many chained jobs cover `requested`.
    ///
    /// The division happens in seconds against the un-floored 90% threshold
    /// (`0.9 * max_job_time`) when `use_safe` is set, so an 8 hour request on
    /// a 1 hour machine splits into ceil(28800 / 3240) = 9 jobs. Machines
    /// without an upper bound always answer 1.
    pub fn n_jobs_for_walltime(&self, requested: Walltime, use_safe: bool) -> u32 {
        let Some(max) = self.max_job_time else {
            return 1;
        };

        let limit_secs = u64::from(max) * 3600;
        let threshold = if use_safe {
            limit_secs - limit_secs / 10
        } else {
            limit_secs
        };

        u32::try_from(requested.as_secs().div_ceil(threshold)).unwrap_or(u32::MAX).max(1)
    }

    /// Per-node task counts with node 0 carrying exactly one task and the
    /// remaining nodes splitting the rest as evenly as possible, remainder on
    /// the last node. Rendered as a comma-joined count list for the
    /// arbitrary-placement launcher.
    pub fn isolated_first_node_distribution(
        &self,
        total_cpus: u32,
        nodes: u32,
    ) -> Result<String, ConfigError> {
        if nodes < 2 || total_cpus < 2 {
            return Err(ConfigError::IsolationNeedsTwoNodes { nodes });
        }

        let rest = total_cpus - 1;
        let others = nodes - 1;
        let base = rest / others;
        let remainder = rest % others;

        let mut counts = vec![1];
        counts.extend(std::iter::repeat(base).take(others as usize - 1));
        counts.push(base + remainder);

        if counts.iter().any(|&count| count > self.cpus_per_node) {
            return Err(ConfigError::NodeOversubscribed {
                cpus_per_node: base + remainder,
                max: self.cpus_per_node,
                machine: self.name.clone(),
            });
        }

        Ok(counts
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(","))
    }

    /// The `module load` block between the scheduler header and the code
    /// body. Empty for machines without modules.
    pub fn module_block(&self) -> String {
        if self.modules.is_empty() {
            return String::new();
        }
        let mut block = self
            .modules
            .iter()
            .map(|module| format!("module load {module}\n"))
            .collect::<String>();
        block.push('\n');
        block
    }
}

/// The machines a config file may name. Built once at process start and
/// passed into the orchestrator; nothing global.
#[derive(Debug, Clone)]
pub struct MachineRegistry {
    machines: BTreeMap<String, Machine>,
}

impl MachineRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self {
            machines: BTreeMap::new(),
        };
        registry.insert(Machine {
            name: "marconi".into(),
            cpus_per_node: 48,
            memory_per_node: 182,
            max_nodes: 64,
            max_job_time: Some(24),
            scheduler: SchedulerKind::Slurm,
            modules: vec!["env-skl".into(), "intel/pe-xe-2018--binary".into()],
        });
        registry.insert(Machine {
            name: "marconi_long".into(),
            cpus_per_node: 48,
            memory_per_node: 182,
            max_nodes: 12,
            max_job_time: Some(180),
            scheduler: SchedulerKind::Slurm,
            modules: vec!["env-skl".into(), "intel/pe-xe-2018--binary".into()],
        });
        registry.insert(Machine {
            name: "cumulus".into(),
            cpus_per_node: 32,
            memory_per_node: 512,
            max_nodes: 16,
            max_job_time: None,
            scheduler: SchedulerKind::Pbs,
            modules: Vec::new(),
        });
        registry
    }

    pub fn insert(&mut self, machine: Machine) {
        self.machines.insert(machine.name.clone(), machine);
    }

    pub fn get(&self, name: &str) -> Option<&Machine> {
        self.machines.get(&name.to_lowercase())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.machines.keys().map(String::as_str)
    }
}
