use itertools::Itertools;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error(
        "requested scan dimensionality {requested} matches neither the number of scanning \
         parameters ({parameters}) nor the number of distinct scan lengths ({distinct_lengths})"
    )]
    DimensionMismatch {
        requested: usize,
        parameters: usize,
        distinct_lengths: usize,
    },
    #[error("linked scan parameters must have equal lengths, got {0:?}")]
    UnequalLinkedLengths(Vec<usize>),
    #[error("scan parameter {section}.{parameter} has no values")]
    EmptyParameter { section: String, parameter: String },
}

/// One parameter to sweep: where it lives in the input deck and the ordered
/// values it takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanParameter {
    pub section: String,
    pub parameter: String,
    pub values: Vec<String>,
}

impl ScanParameter {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn labelled(&self, index: usize) -> String {
        format!("{}_{}", self.parameter, self.values[index])
    }
}

/// One concrete combination of scan values. `assignments` carries
/// `(section, parameter, value)` for every swept parameter; `label` names
/// the variant's output sub-directory and job-name suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanVariant {
    pub assignments: Vec<(String, String, String)>,
    pub label: String,
}

/// Expand scan descriptors into the ordered list of variants.
///
/// `requested_dims` of 0 means auto: a single descriptor scans its values
/// directly, several descriptors get one dimension per distinct value-count.
/// A dimensionality of 1 links all descriptors element-wise (equal lengths
/// required). A dimensionality equal to the number of distinct lengths
/// groups descriptors by length into dimensions, linked within a group,
/// Cartesian across groups. A dimensionality equal to the descriptor count
/// takes the plain Cartesian product. Anything else is a `ScanError`.
///
/// Grouping by shared length is a heuristic carried over from the original
/// workflow: two unrelated parameters that happen to have the same number of
/// values will be linked. Pass an explicit dimensionality to get the full
/// product instead.
pub fn expand(
    parameters: &[ScanParameter],
    requested_dims: usize,
) -> Result<Vec<ScanVariant>, ScanError> {
    if parameters.is_empty() {
        return Ok(Vec::new());
    }
    if let Some(empty) = parameters.iter().find(|parameter| parameter.is_empty()) {
        return Err(ScanError::EmptyParameter {
            section: empty.section.clone(),
            parameter: empty.parameter.clone(),
        });
    }

    // distinct value-counts, in order of first appearance
    let distinct_lengths = parameters
        .iter()
        .map(ScanParameter::len)
        .unique()
        .collect_vec();

    let variants = if parameters.len() == 1 {
        let parameter = &parameters[0];
        (0..parameter.len())
            .map(|index| variant_at(&[parameter], &[index]))
            .collect_vec()
    } else {
        let dims = if requested_dims == 0 {
            distinct_lengths.len()
        } else {
            requested_dims
        };

        if dims == 1 {
            if distinct_lengths.len() != 1 {
                return Err(ScanError::UnequalLinkedLengths(
                    parameters.iter().map(ScanParameter::len).collect(),
                ));
            }
            (0..distinct_lengths[0])
                .map(|index| linked_variant(parameters, index))
                .collect_vec()
        } else if dims == distinct_lengths.len() {
            grouped_product(parameters, &distinct_lengths)
        } else if dims == parameters.len() {
            full_product(parameters)
        } else {
            return Err(ScanError::DimensionMismatch {
                requested: dims,
                parameters: parameters.len(),
                distinct_lengths: distinct_lengths.len(),
            });
        }
    };

    preview(&variants);
    Ok(variants)
}

/// Variant from one index per listed parameter, labelled by every parameter.
fn variant_at(parameters: &[&ScanParameter], indices: &[usize]) -> ScanVariant {
    let assignments = parameters
        .iter()
        .zip(indices)
        .map(|(parameter, &index)| {
            (
                parameter.section.clone(),
                parameter.parameter.clone(),
                parameter.values[index].clone(),
            )
        })
        .collect();
    let label = parameters
        .iter()
        .zip(indices)
        .map(|(parameter, &index)| parameter.labelled(index))
        .join("__");
    ScanVariant { assignments, label }
}

/// All parameters move together; the first one provides the label.
fn linked_variant(parameters: &[ScanParameter], index: usize) -> ScanVariant {
    let assignments = parameters
        .iter()
        .map(|parameter| {
            (
                parameter.section.clone(),
                parameter.parameter.clone(),
                parameter.values[index].clone(),
            )
        })
        .collect();
    ScanVariant {
        assignments,
        label: parameters[0].labelled(index),
    }
}

/// Cartesian product across length-groups, linked within each group. Each
/// group is labelled by its first parameter.
fn grouped_product(parameters: &[ScanParameter], lengths: &[usize]) -> Vec<ScanVariant> {
    let groups = lengths
        .iter()
        .map(|&length| {
            parameters
                .iter()
                .filter(|parameter| parameter.len() == length)
                .collect_vec()
        })
        .collect_vec();

    lengths
        .iter()
        .map(|&length| 0..length)
        .multi_cartesian_product()
        .map(|indices| {
            let assignments = groups
                .iter()
                .zip(&indices)
                .flat_map(|(group, &index)| {
                    group.iter().map(move |parameter| {
                        (
                            parameter.section.clone(),
                            parameter.parameter.clone(),
                            parameter.values[index].clone(),
                        )
                    })
                })
                .collect();
            let label = groups
                .iter()
                .zip(&indices)
                .map(|(group, &index)| group[0].labelled(index))
                .join("__");
            ScanVariant { assignments, label }
        })
        .collect_vec()
}

fn full_product(parameters: &[ScanParameter]) -> Vec<ScanVariant> {
    let parameters = parameters.iter().collect_vec();
    parameters
        .iter()
        .map(|parameter| 0..parameter.len())
        .multi_cartesian_product()
        .map(|indices| variant_at(&parameters, &indices))
        .collect_vec()
}

/// Large scans would flood the console; show only the edges of the list.
fn preview(variants: &[ScanVariant]) {
    if variants.len() <= 100 {
        for variant in variants {
            info!("scan variant: {}", variant.label);
        }
        return;
    }

    warn!(
        "scan expands to {} variants, previewing the first 20 and last 5",
        variants.len()
    );
    for variant in &variants[..20] {
        info!("scan variant: {}", variant.label);
    }
    info!("...");
    for variant in &variants[variants.len() - 5..] {
        info!("scan variant: {}", variant.label);
    }
}
