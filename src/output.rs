use log::{debug, warn};
use serde::Serialize;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{JoinError, Result};
use crate::join::JoinedDot;
use crate::nuclei::{NucleusCatalog, NucleusRecord};
use crate::schemas::{GlobalJoinRow, ImageJoinRow, GLOBAL_JOIN_HEADERS, IMAGE_JOIN_HEADERS};

pub const GLOBAL_NUCLEI_FILENAME: &str = "nuclei.json";
pub const GLOBAL_JOIN_FILENAME: &str = "nuclei_dots_joined.csv";

// Suffix of global files while a run is still writing them.
pub const PARTIAL_SUFFIX: &str = ".partial";

fn with_suffix(image: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = image.with_extension("").into_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

pub fn image_nuclei_filename(image: &Path) -> PathBuf {
    with_suffix(image, "_nuclei.json")
}

pub fn image_join_filename(image: &Path) -> PathBuf {
    with_suffix(image, "_nuclei_dots_joined.csv")
}

pub fn global_nuclei_filename(base_dir: &Path) -> PathBuf {
    base_dir.join(GLOBAL_NUCLEI_FILENAME)
}

pub fn global_join_filename(base_dir: &Path) -> PathBuf {
    base_dir.join(GLOBAL_JOIN_FILENAME)
}

pub fn partial_filename(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArrayState {
    Empty,
    HasItems,
    Closed,
}

/// Writes a JSON array one element at a time, so arbitrarily many records can
/// be streamed without holding them in memory. The layout is `[` and a
/// newline, the elements separated by `,`, then `]` and a newline.
pub struct JsonArrayWriter<W: Write> {
    out: W,
    state: ArrayState,
    len: usize,
}

impl<W: Write> JsonArrayWriter<W> {
    pub fn new(mut out: W) -> Result<Self> {
        out.write_all(b"[\n")?;
        Ok(JsonArrayWriter {
            out,
            state: ArrayState::Empty,
            len: 0,
        })
    }

    pub fn state(&self) -> ArrayState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn append<T: Serialize>(&mut self, item: &T) -> Result<()> {
        match self.state {
            ArrayState::Closed => return Err(JoinError::StreamClosed),
            ArrayState::HasItems => self.out.write_all(b",")?,
            ArrayState::Empty => {}
        }
        serde_json::to_writer(&mut self.out, item)?;
        self.state = ArrayState::HasItems;
        self.len += 1;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.state == ArrayState::Closed {
            return Err(JoinError::StreamClosed);
        }
        self.out.write_all(b"]\n")?;
        self.out.flush()?;
        self.state = ArrayState::Closed;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

// CSV of joined dots with the header written up front, so a file with no
// dots still has its header row.
pub struct JoinCsvWriter<W: Write> {
    writer: csv::Writer<W>,
    rows: usize,
}

impl<W: Write> JoinCsvWriter<W> {
    fn with_headers(out: W, headers: &[&str]) -> Result<Self> {
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(out);
        writer.write_record(headers)?;
        Ok(JoinCsvWriter { writer, rows: 0 })
    }

    pub fn image(out: W) -> Result<Self> {
        Self::with_headers(out, &IMAGE_JOIN_HEADERS)
    }

    pub fn global(out: W) -> Result<Self> {
        Self::with_headers(out, &GLOBAL_JOIN_HEADERS)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn write_image_rows(&mut self, rows: &[JoinedDot]) -> Result<()> {
        for row in rows {
            self.writer.serialize(ImageJoinRow::from(row))?;
        }
        self.rows += rows.len();
        Ok(())
    }

    pub fn write_global_rows(&mut self, rows: &[JoinedDot], filename: &str) -> Result<()> {
        for row in rows {
            self.writer.serialize(GlobalJoinRow::new(row, filename))?;
        }
        self.rows += rows.len();
        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        self.writer
            .into_inner()
            .map_err(|e| JoinError::Io(e.into_error()))
    }
}

pub fn write_image_nuclei(path: &Path, catalog: &NucleusCatalog) -> Result<()> {
    let mut writer = JsonArrayWriter::new(BufWriter::new(File::create(path)?))?;
    for nucleus in catalog {
        writer.append(&NucleusRecord::new(nucleus, None))?;
    }
    writer.close()
}

pub fn write_image_join(path: &Path, rows: &[JoinedDot]) -> Result<()> {
    let mut writer = JoinCsvWriter::image(BufWriter::new(File::create(path)?))?;
    writer.write_image_rows(rows)?;
    writer.finish()?.flush()?;
    Ok(())
}

// Read a per-image or global nuclei file back into records.
pub fn read_nuclei_json(path: &Path) -> Result<Vec<NucleusRecord>> {
    let file = File::open(path).map_err(|source| JoinError::MissingInput {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("removed stale output {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// The two run-wide outputs in the base directory. They are written under a
/// `.partial` name and only moved to their final names by `finish`, so a run
/// that stops early never leaves a truncated file under the final name.
pub struct GlobalStreams {
    nuclei: JsonArrayWriter<BufWriter<File>>,
    join: JoinCsvWriter<BufWriter<File>>,
    nuclei_path: PathBuf,
    join_path: PathBuf,
}

impl GlobalStreams {
    pub fn create(base_dir: &Path) -> Result<Self> {
        let nuclei_path = global_nuclei_filename(base_dir);
        let join_path = global_join_filename(base_dir);

        // outputs of an earlier run must not be mistaken for this run's
        remove_if_exists(&nuclei_path)?;
        remove_if_exists(&join_path)?;

        let nuclei = JsonArrayWriter::new(BufWriter::new(File::create(partial_filename(&nuclei_path))?))?;
        let join = JoinCsvWriter::global(BufWriter::new(File::create(partial_filename(&join_path))?))?;

        Ok(GlobalStreams {
            nuclei,
            join,
            nuclei_path,
            join_path,
        })
    }

    pub fn append_image(&mut self, filename: &str, catalog: &NucleusCatalog, rows: &[JoinedDot]) -> Result<()> {
        for nucleus in catalog {
            self.nuclei.append(&NucleusRecord::new(nucleus, Some(filename)))?;
        }
        self.join.write_global_rows(rows, filename)
    }

    pub fn nuclei_written(&self) -> usize {
        self.nuclei.len()
    }

    pub fn dots_written(&self) -> usize {
        self.join.rows()
    }

    pub fn finish(mut self) -> Result<(PathBuf, PathBuf)> {
        self.nuclei.close()?;
        self.nuclei.into_inner().flush()?;
        self.join.finish()?.flush()?;

        let nuclei_partial = partial_filename(&self.nuclei_path);
        fs::rename(&nuclei_partial, &self.nuclei_path)?;
        // Both files appear under their final names or neither does.
        if let Err(e) = fs::rename(partial_filename(&self.join_path), &self.join_path) {
            if let Err(undo) = fs::rename(&self.nuclei_path, &nuclei_partial) {
                warn!(
                    "unable to move {} back to {}: {}",
                    self.nuclei_path.display(),
                    nuclei_partial.display(),
                    undo
                );
            }
            return Err(e.into());
        }

        Ok((self.nuclei_path, self.join_path))
    }
}
