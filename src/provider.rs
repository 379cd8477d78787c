// Nuclei and dots come from external segmentation and detection tools. The
// aggregator only sees them through these two capabilities, so the join can be
// driven by anything from a subprocess wrapper to an in-memory fixture.

use log::{debug, trace};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::dots::{read_dot_table, DotTable};
use crate::error::{JoinError, Result};
use crate::nuclei::{parse_qupath_geojson, AreaSource, ParsedCatalog};
use crate::overrides::{ImageOverrides, Params};

// Shared flag used to stop a batch from another thread.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Everything a provider gets to know about one acquisition: the image, the
/// per-file overrides that apply to it, and the cancellation and deadline it
/// must honour. Long-running providers should call `checkpoint` regularly and
/// bound any blocking wait by `remaining`.
pub struct AcquireContext<'a> {
    image: &'a Path,
    cancel: &'a CancelToken,
    deadline: Option<Instant>,
    overrides: Option<&'a ImageOverrides>,
}

impl<'a> AcquireContext<'a> {
    pub fn new(
        image: &'a Path,
        cancel: &'a CancelToken,
        timeout: Option<Duration>,
        overrides: Option<&'a ImageOverrides>,
    ) -> Self {
        AcquireContext {
            image,
            cancel,
            deadline: timeout.map(|t| Instant::now() + t),
            overrides,
        }
    }

    pub fn image(&self) -> &Path {
        self.image
    }

    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(JoinError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(JoinError::TimedOut {
                    image: self.image.to_path_buf(),
                });
            }
        }
        Ok(())
    }

    // Time left before the deadline, or None when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn nuclei_params(&self) -> Option<&'a Params> {
        self.overrides
            .map(|o| &o.nuclei)
            .filter(|params| !params.is_empty())
    }

    pub fn dot_params(&self, channel: u32) -> Option<&'a Params> {
        self.overrides.and_then(|o| o.dot_params(channel))
    }
}

// The catalog comes back together with the candidates that were dropped.
pub trait NucleusProvider {
    fn nuclei(&self, image: &Path, ctx: &AcquireContext) -> Result<ParsedCatalog>;
}

pub trait DotProvider {
    fn dots(&self, image: &Path, channel: u32, ctx: &AcquireContext) -> Result<DotTable>;
}

impl<F, C> NucleusProvider for F
where
    F: Fn(&Path, &AcquireContext) -> Result<C>,
    C: Into<ParsedCatalog>,
{
    fn nuclei(&self, image: &Path, ctx: &AcquireContext) -> Result<ParsedCatalog> {
        self(image, ctx).map(Into::into)
    }
}

impl<F> DotProvider for F
where
    F: Fn(&Path, u32, &AcquireContext) -> Result<DotTable>,
{
    fn dots(&self, image: &Path, channel: u32, ctx: &AcquireContext) -> Result<DotTable> {
        self(image, channel, ctx)
    }
}

// Reads the GeoJSON QuPath exports next to each image, named
// `<image without extension>_nuclei.geojson`.
#[derive(Clone, Debug)]
pub struct GeoJsonNucleusProvider {
    suffix: String,
    area_source: AreaSource,
}

impl Default for GeoJsonNucleusProvider {
    fn default() -> Self {
        GeoJsonNucleusProvider {
            suffix: String::from("_nuclei.geojson"),
            area_source: AreaSource::default(),
        }
    }
}

impl GeoJsonNucleusProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_area_source(mut self, area_source: AreaSource) -> Self {
        self.area_source = area_source;
        self
    }

    pub fn geojson_filename(&self, image: &Path) -> PathBuf {
        let mut name = image.with_extension("").into_os_string();
        name.push(&self.suffix);
        PathBuf::from(name)
    }
}

impl NucleusProvider for GeoJsonNucleusProvider {
    fn nuclei(&self, image: &Path, ctx: &AcquireContext) -> Result<ParsedCatalog> {
        ctx.checkpoint()?;
        if ctx.nuclei_params().is_some() {
            debug!(
                "{}: nucleus overrides have no effect on precomputed segmentation",
                image.display()
            );
        }

        let path = self.geojson_filename(image);
        let file = File::open(&path).map_err(|source| JoinError::MissingInput {
            path: path.clone(),
            source,
        })?;

        let invalid = |reason: String| JoinError::InvalidGeoJson {
            path: path.clone(),
            reason,
        };

        let geojson: serde_json::Value =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| invalid(e.to_string()))?;
        let parsed = parse_qupath_geojson(&geojson, self.area_source).map_err(invalid)?;

        trace!(
            "{}: {} nuclei, {} candidates skipped",
            path.display(),
            parsed.catalog.len(),
            parsed.skipped.len()
        );

        Ok(parsed)
    }
}

// Reads RS-FISH result tables, named `<image stem>_C<channel>.csv` and kept
// in the image's directory.
#[derive(Clone, Debug)]
pub struct CsvDotProvider {
    extension: String,
}

impl Default for CsvDotProvider {
    fn default() -> Self {
        CsvDotProvider {
            extension: String::from("csv"),
        }
    }
}

impl CsvDotProvider {
    pub fn new() -> Self {
        Self::default()
    }

    // e.g. "csv.gz" for compressed tables
    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.to_string();
        self
    }

    pub fn table_filename(&self, image: &Path, channel: u32) -> PathBuf {
        let stem = image.file_stem().unwrap_or_default().to_string_lossy();
        let name = format!("{}_C{}.{}", stem, channel, self.extension);
        match image.parent() {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }
}

impl DotProvider for CsvDotProvider {
    fn dots(&self, image: &Path, channel: u32, ctx: &AcquireContext) -> Result<DotTable> {
        ctx.checkpoint()?;
        if ctx.dot_params(channel).is_some() {
            debug!(
                "{}: channel {} overrides have no effect on precomputed detections",
                image.display(),
                channel
            );
        }
        read_dot_table(&self.table_filename(image, channel))
    }
}
