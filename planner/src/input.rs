use crate::scan::ScanParameter;
use std::{fmt, fs, io, path::Path, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeckError {
    #[error("failed to read input deck")]
    Io(#[from] io::Error),
    #[error("line {line} of the input deck is neither a section header nor a key-value pair: '{text}'")]
    Malformed { line: usize, text: String },
    #[error("key-value pair on line {line} appears before any section header")]
    OrphanPair { line: usize },
    #[error("input deck has no section '{0}'")]
    MissingSection(String),
    #[error("section '{section}' of the input deck has no key '{key}'")]
    MissingKey { section: String, key: String },
    #[error("value '{value}' of {section}.{key} is not an integer")]
    NotAnInteger {
        section: String,
        key: String,
        value: String,
    },
}

/// A simulation input deck: ordered sections of ordered key-value pairs.
///
/// The reader covers exactly the two-token format the supported codes use
/// (`[section]` headers, `key = value` pairs, `!`/`#` comment lines). A value
/// written as a bracketed list (`[a, b, c]`) marks that key as a scanning
/// parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct InputDeck {
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl InputDeck {
    pub fn load(path: &Path) -> Result<Self, DeckError> {
        fs::read_to_string(path)?.parse()
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|(name, _)| name == section)?
            .1
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn require(&self, section: &str, key: &str) -> Result<&str, DeckError> {
        if !self.sections.iter().any(|(name, _)| name == section) {
            return Err(DeckError::MissingSection(section.to_owned()));
        }
        self.get(section, key).ok_or_else(|| DeckError::MissingKey {
            section: section.to_owned(),
            key: key.to_owned(),
        })
    }

    pub fn require_int(&self, section: &str, key: &str) -> Result<i64, DeckError> {
        let value = self.require(section, key)?;
        value.parse().map_err(|_| DeckError::NotAnInteger {
            section: section.to_owned(),
            key: key.to_owned(),
            value: value.to_owned(),
        })
    }

    /// Overwrite the value of an existing key, or append it to the section
    /// (creating the section if necessary).
    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        let entries = match self.sections.iter_mut().find(|(name, _)| name == section) {
            Some((_, entries)) => entries,
            None => {
                self.sections.push((section.to_owned(), Vec::new()));
                &mut self.sections.last_mut().unwrap().1
            }
        };
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_owned(),
            None => entries.push((key.to_owned(), value.to_owned())),
        }
    }

    /// All keys whose value is a bracketed list, in deck order.
    pub fn scanning_params(&self) -> Vec<ScanParameter> {
        self.sections
            .iter()
            .flat_map(|(section, entries)| {
                entries.iter().filter_map(|(key, value)| {
                    parse_value_list(value).map(|values| ScanParameter {
                        section: section.clone(),
                        parameter: key.clone(),
                        values,
                    })
                })
            })
            .collect()
    }

    pub fn write(&self, path: &Path) -> Result<(), DeckError> {
        fs::write(path, self.to_string())?;
        Ok(())
    }
}

impl FromStr for InputDeck {
    type Err = DeckError;

    fn from_str(text: &str) -> Result<Self, DeckError> {
        let mut sections: Vec<(String, Vec<(String, String)>)> = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('!') || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let name = line[1..line.len() - 1].trim().to_owned();
                sections.push((name, Vec::new()));
            } else if let Some((key, value)) = line.split_once('=') {
                let section = sections.last_mut().ok_or(DeckError::OrphanPair {
                    line: index + 1,
                })?;
                section
                    .1
                    .push((key.trim().to_owned(), value.trim().to_owned()));
            } else {
                return Err(DeckError::Malformed {
                    line: index + 1,
                    text: line.to_owned(),
                });
            }
        }

        Ok(Self { sections })
    }
}

impl fmt::Display for InputDeck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, entries) in &self.sections {
            writeln!(f, "[{name}]")?;
            for (key, value) in entries {
                writeln!(f, "{key} = {value}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

fn parse_value_list(value: &str) -> Option<Vec<String>> {
    let inner = value.strip_prefix('[')?.strip_suffix(']')?;
    let values = inner
        .split(',')
        .map(|part| part.trim().to_owned())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>();
    (!values.is_empty()).then_some(values)
}
