// Per-file parameter overrides.
//
// The override table is a CSV with a `filename` column and one column per
// (channel, parameter) pair named `ch<N>:<param>`, e.g. `ch4:threshold`.
// Filenames are relative to the batch base directory. Empty cells mean "no
// override".

use log::warn;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::error::{JoinError, Result};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    // Most specific type that parses: integer, then float, then text.
    pub fn typify(text: &str) -> Self {
        if let Ok(value) = text.parse::<i64>() {
            ParamValue::Int(value)
        } else if let Ok(value) = text.parse::<f64>() {
            ParamValue::Float(value)
        } else {
            ParamValue::Text(text.to_string())
        }
    }
}

pub type Params = BTreeMap<String, ParamValue>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImageOverrides {
    pub nuclei: Params,
    pub dots: BTreeMap<u32, Params>,
}

impl ImageOverrides {
    pub fn dot_params(&self, channel: u32) -> Option<&Params> {
        self.dots.get(&channel)
    }

    pub fn is_empty(&self) -> bool {
        self.nuclei.is_empty() && self.dots.is_empty()
    }
}

// Problems in the override table that are dropped rather than failing the run.
#[derive(Error, Clone, Debug, PartialEq)]
pub enum OverrideDiagnostic {
    #[error("per-file param file includes column {column} for channel {channel} which is unused by nuclei or dots (file {})", filename.display())]
    UnresolvedChannelColumn {
        filename: PathBuf,
        column: String,
        channel: u32,
    },

    #[error("per-file param file includes multiple entries for file {}, ignoring duplicate entries", filename.display())]
    DuplicateFileEntry { filename: PathBuf },
}

struct ParamColumn {
    index: usize,
    header: String,
    channel: u32,
    param: String,
}

// `ch4:threshold` -> (4, "threshold")
fn parse_column_name(header: &str) -> Option<(u32, String)> {
    let (channel, param) = header.split_once(':')?;
    let channel = channel.trim().strip_prefix("ch")?.parse::<u32>().ok()?;
    let param = param.trim();
    if param.is_empty() {
        return None;
    }
    Some((channel, param.to_string()))
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PerFileOverrides {
    entries: HashMap<PathBuf, ImageOverrides>,
}

impl PerFileOverrides {
    pub fn read(
        path: &Path,
        base_dir: &Path,
        nuclei_channel: u32,
        dot_channels: &[u32],
    ) -> Result<(Self, Vec<OverrideDiagnostic>)> {
        let file = File::open(path).map_err(|source| JoinError::MissingInput {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(file, path, base_dir, nuclei_channel, dot_channels)
    }

    // `source` only labels errors.
    pub fn from_reader<R: Read>(
        input: R,
        source: &Path,
        base_dir: &Path,
        nuclei_channel: u32,
        dot_channels: &[u32],
    ) -> Result<(Self, Vec<OverrideDiagnostic>)> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(input);

        let headers = rdr.headers()?.clone();
        let filename_col = headers
            .iter()
            .position(|h| h == "filename")
            .ok_or_else(|| JoinError::MissingColumn {
                path: source.to_path_buf(),
                column: String::from("filename"),
            })?;

        let mut columns = Vec::new();
        for (index, header) in headers.iter().enumerate() {
            if index == filename_col {
                continue;
            }
            let (channel, param) = parse_column_name(header)
                .ok_or_else(|| JoinError::MalformedOverrideColumn(header.to_string()))?;
            columns.push(ParamColumn {
                index,
                header: header.to_string(),
                channel,
                param,
            });
        }

        let mut entries = HashMap::new();
        let mut seen = HashSet::new();
        let mut diagnostics = Vec::new();

        for (i, result) in rdr.records().enumerate() {
            let row = result.map_err(|e| JoinError::MalformedRow {
                path: source.to_path_buf(),
                row: i + 1,
                reason: e.to_string(),
            })?;

            let filename = base_dir.join(row.get(filename_col).unwrap_or_default());
            if !seen.insert(filename.clone()) {
                let diagnostic = OverrideDiagnostic::DuplicateFileEntry { filename };
                warn!("{}", diagnostic);
                diagnostics.push(diagnostic);
                continue;
            }

            let mut overrides = ImageOverrides::default();
            for column in &columns {
                let text = row.get(column.index).unwrap_or_default();
                if text.is_empty() {
                    continue;
                }
                let value = ParamValue::typify(text);

                if column.channel == nuclei_channel {
                    overrides.nuclei.insert(column.param.clone(), value);
                } else if dot_channels.contains(&column.channel) {
                    overrides
                        .dots
                        .entry(column.channel)
                        .or_default()
                        .insert(column.param.clone(), value);
                } else {
                    let diagnostic = OverrideDiagnostic::UnresolvedChannelColumn {
                        filename: filename.clone(),
                        column: column.header.clone(),
                        channel: column.channel,
                    };
                    warn!("{}", diagnostic);
                    diagnostics.push(diagnostic);
                }
            }

            if !overrides.is_empty() {
                entries.insert(filename, overrides);
            }
        }

        Ok((PerFileOverrides { entries }, diagnostics))
    }

    pub fn get(&self, image: &Path) -> Option<&ImageOverrides> {
        self.entries.get(image)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
