use flate2::read::GzDecoder;
use geo::Coord;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{JoinError, Result};

// One detected spot, as reported by the dot detector for a single channel.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Dot {
    pub x: f64,
    pub y: f64,
    pub t: u32,
    pub c: u32,
    pub intensity: f64,
}

impl Dot {
    pub fn coords(&self) -> Coord<f64> {
        Coord {
            x: self.x,
            y: self.y,
        }
    }
}

// All dots detected in one channel of one image, in detector order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DotTable {
    dots: Vec<Dot>,
}

impl DotTable {
    pub fn new(dots: Vec<Dot>) -> Self {
        DotTable { dots }
    }

    pub fn len(&self) -> usize {
        self.dots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dots.is_empty()
    }

    pub fn as_slice(&self) -> &[Dot] {
        &self.dots
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Dot> {
        self.dots.iter()
    }
}

impl FromIterator<Dot> for DotTable {
    fn from_iter<I: IntoIterator<Item = Dot>>(iter: I) -> Self {
        DotTable {
            dots: iter.into_iter().collect(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TableFormat {
    Csv,
    CsvGz,
}

pub fn determine_format(path: &Path) -> TableFormat {
    let name = path.to_string_lossy();
    if name.ends_with(".gz") {
        TableFormat::CsvGz
    } else {
        TableFormat::Csv
    }
}

pub fn read_dot_table(path: &Path) -> Result<DotTable> {
    let file = File::open(path).map_err(|source| JoinError::MissingInput {
        path: path.to_path_buf(),
        source,
    })?;

    match determine_format(path) {
        TableFormat::Csv => read_dot_table_from_reader(file, path),
        TableFormat::CsvGz => read_dot_table_from_reader(GzDecoder::new(file), path),
    }
}

fn find_column(headers: &csv::StringRecord, column: &str, path: &Path) -> Result<usize> {
    headers
        .iter()
        .position(|x| x == column)
        .ok_or_else(|| JoinError::MissingColumn {
            path: path.to_path_buf(),
            column: column.to_string(),
        })
}

// `path` is only used to label errors. Columns other than x, y, t, c and
// intensity are ignored.
pub fn read_dot_table_from_reader<R: Read>(input: R, path: &Path) -> Result<DotTable> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(input);

    let malformed = |row: usize, reason: String| JoinError::MalformedRow {
        path: path.to_path_buf(),
        row,
        reason,
    };

    let headers = rdr.headers().map_err(|e| malformed(0, e.to_string()))?;
    let columns = DotColumns {
        x: find_column(headers, "x", path)?,
        y: find_column(headers, "y", path)?,
        t: find_column(headers, "t", path)?,
        c: find_column(headers, "c", path)?,
        intensity: find_column(headers, "intensity", path)?,
    };

    let mut dots = Vec::new();
    for (i, result) in rdr.records().enumerate() {
        let row = result.map_err(|e| malformed(i + 1, e.to_string()))?;
        dots.push(parse_row(&row, &columns).map_err(|reason| malformed(i + 1, reason))?);
    }

    Ok(DotTable { dots })
}

struct DotColumns {
    x: usize,
    y: usize,
    t: usize,
    c: usize,
    intensity: usize,
}

fn parse_row(row: &csv::StringRecord, columns: &DotColumns) -> std::result::Result<Dot, String> {
    let field = |col: usize, name: &'static str| {
        row.get(col).ok_or_else(|| format!("missing '{}' value", name))
    };

    let coordinate = |col: usize, name: &'static str| {
        let text = field(col, name)?;
        text.parse::<f64>()
            .map_err(|_| format!("'{}' is not a number: '{}'", name, text))
    };

    let index = |col: usize, name: &'static str| {
        let text = field(col, name)?;
        parse_index(text).ok_or_else(|| format!("'{}' is not an index: '{}'", name, text))
    };

    Ok(Dot {
        x: coordinate(columns.x, "x")?,
        y: coordinate(columns.y, "y")?,
        t: index(columns.t, "t")?,
        c: index(columns.c, "c")?,
        intensity: coordinate(columns.intensity, "intensity")?,
    })
}

// Detectors sometimes write integral columns as floats ("1.0").
fn parse_index(text: &str) -> Option<u32> {
    if let Ok(value) = text.parse::<u32>() {
        return Some(value);
    }
    let value = text.parse::<f64>().ok()?;
    if value.fract() == 0.0 && value >= 0.0 && value <= u32::MAX as f64 {
        Some(value as u32)
    } else {
        None
    }
}
