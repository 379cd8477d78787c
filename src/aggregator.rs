// Drive the join over a batch of images and stream the results into the
// per-image and run-wide output files.

use indicatif::{ProgressBar, ProgressStyle};
use log::{info, trace, warn};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dots::DotTable;
use crate::error::{JoinError, Result};
use crate::join::{join_image, RowOrder};
use crate::nuclei::NucleusCatalog;
use crate::output::{
    image_join_filename, image_nuclei_filename, remove_if_exists, write_image_join, write_image_nuclei, GlobalStreams,
};
use crate::overrides::PerFileOverrides;
use crate::provider::{AcquireContext, CancelToken, DotProvider, NucleusProvider};

// What happens when an image's nuclei or dots can't be obtained. Write
// failures and cancellation always stop the batch.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    #[default]
    SkipImage,
    AbortBatch,
}

#[derive(Clone, Debug)]
pub struct AggregatorConfig {
    // Directory receiving the run-wide nuclei.json and nuclei_dots_joined.csv.
    pub base_dir: PathBuf,
    pub nuclei_channel: u32,
    // Dot channels, joined and written in this order.
    pub dot_channels: Vec<u32>,
    pub failure_policy: FailurePolicy,
    pub row_order: RowOrder,
    // Budget for acquiring one image's nuclei and all of its dot tables.
    pub acquire_timeout: Option<Duration>,
    pub show_progress: bool,
}

impl AggregatorConfig {
    pub fn new(base_dir: impl Into<PathBuf>, nuclei_channel: u32, dot_channels: Vec<u32>) -> Self {
        AggregatorConfig {
            base_dir: base_dir.into(),
            nuclei_channel,
            dot_channels,
            failure_policy: FailurePolicy::default(),
            row_order: RowOrder::default(),
            acquire_timeout: None,
            show_progress: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dot_channels.is_empty() {
            return Err(JoinError::Config(String::from("at least one dot channel is required")));
        }

        let mut seen = HashSet::new();
        for &channel in &self.dot_channels {
            if channel == self.nuclei_channel {
                return Err(JoinError::Config(format!(
                    "channel {} is configured both as the nuclei channel and as a dot channel",
                    channel
                )));
            }
            if !seen.insert(channel) {
                return Err(JoinError::Config(format!("dot channel {} is listed twice", channel)));
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
pub struct SkippedImage {
    pub image: PathBuf,
    pub error: JoinError,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub images_processed: usize,
    pub skipped: Vec<SkippedImage>,
    // Nucleus candidates dropped from images that were otherwise processed.
    pub feature_diagnostics: Vec<(PathBuf, JoinError)>,
    pub nuclei_written: usize,
    pub dots_written: usize,
    pub global_nuclei_path: PathBuf,
    pub global_join_path: PathBuf,
}

// Image paths, one per line. Blank lines are ignored.
pub fn read_file_list(path: &Path) -> Result<Vec<PathBuf>> {
    let text = fs::read_to_string(path).map_err(|source| JoinError::MissingInput {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect())
}

struct ImageInputs {
    catalog: NucleusCatalog,
    diagnostics: Vec<JoinError>,
    tables: Vec<(u32, DotTable)>,
}

pub struct StreamingAggregator<N, D> {
    config: AggregatorConfig,
    nuclei: N,
    dots: D,
    overrides: PerFileOverrides,
    cancel: CancelToken,
}

impl<N, D> StreamingAggregator<N, D>
where
    N: NucleusProvider,
    D: DotProvider,
{
    pub fn new(config: AggregatorConfig, nuclei: N, dots: D) -> Result<Self> {
        config.validate()?;
        Ok(StreamingAggregator {
            config,
            nuclei,
            dots,
            overrides: PerFileOverrides::default(),
            cancel: CancelToken::new(),
        })
    }

    pub fn with_overrides(mut self, overrides: PerFileOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn run_file_list(&self, file_list: &Path) -> Result<BatchReport> {
        let images = read_file_list(file_list)?;
        self.run(&images)
    }

    /// Process `images` in order. Each image gets its own nuclei and join
    /// files, and its records are appended to the run-wide files, which only
    /// appear under their final names once the whole batch has succeeded.
    pub fn run<P: AsRef<Path>>(&self, images: &[P]) -> Result<BatchReport> {
        info!(
            "Starting dots processing: {} images, dot channels {:?}",
            images.len(),
            self.config.dot_channels
        );

        let mut streams = GlobalStreams::create(&self.config.base_dir)?;
        let mut report = BatchReport::default();

        let progress = if self.config.show_progress {
            ProgressBar::new(images.len() as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::with_template("{prefix} [{bar:40}] {pos}/{len} {msg}") {
            progress.set_style(style);
        }
        progress.set_prefix("joining");

        for image in images {
            let image = image.as_ref();
            if self.cancel.is_cancelled() {
                return Err(JoinError::Cancelled);
            }
            progress.set_message(image.display().to_string());

            match self.acquire(image) {
                Ok(inputs) => {
                    self.write_image(image, &inputs, &mut streams)?;
                    report.images_processed += 1;
                    report.feature_diagnostics.extend(
                        inputs
                            .diagnostics
                            .into_iter()
                            .map(|error| (image.to_path_buf(), error)),
                    );
                }
                Err(error)
                    if error.is_acquisition_failure()
                        && self.config.failure_policy == FailurePolicy::SkipImage =>
                {
                    warn!("Skipping {}: {}", image.display(), error);
                    // a skipped image has no per-image outputs, not even old ones
                    remove_if_exists(&image_nuclei_filename(image))?;
                    remove_if_exists(&image_join_filename(image))?;
                    report.skipped.push(SkippedImage {
                        image: image.to_path_buf(),
                        error,
                    });
                }
                Err(error) => return Err(error),
            }

            progress.inc(1);
        }
        progress.finish_and_clear();

        report.nuclei_written = streams.nuclei_written();
        report.dots_written = streams.dots_written();
        let (nuclei_path, join_path) = streams.finish()?;
        report.global_nuclei_path = nuclei_path;
        report.global_join_path = join_path;

        info!(
            "Finished processing all files: {} processed, {} skipped, {} nuclei, {} dots",
            report.images_processed,
            report.skipped.len(),
            report.nuclei_written,
            report.dots_written
        );

        Ok(report)
    }

    fn acquire(&self, image: &Path) -> Result<ImageInputs> {
        let ctx = AcquireContext::new(
            image,
            &self.cancel,
            self.config.acquire_timeout,
            self.overrides.get(image),
        );

        ctx.checkpoint()?;
        let parsed = self.nuclei.nuclei(image, &ctx)?;

        let mut tables = Vec::with_capacity(self.config.dot_channels.len());
        for &channel in &self.config.dot_channels {
            ctx.checkpoint()?;
            tables.push((channel, self.dots.dots(image, channel, &ctx)?));
        }

        Ok(ImageInputs {
            catalog: parsed.catalog,
            diagnostics: parsed.skipped,
            tables,
        })
    }

    fn write_image(&self, image: &Path, inputs: &ImageInputs, streams: &mut GlobalStreams) -> Result<()> {
        let rows = join_image(&inputs.catalog, &inputs.tables, self.config.row_order);
        trace!(
            "{}: {} nuclei, {} dots",
            image.display(),
            inputs.catalog.len(),
            rows.len()
        );

        write_image_nuclei(&image_nuclei_filename(image), &inputs.catalog)?;
        write_image_join(&image_join_filename(image), &rows)?;

        let filename = image.to_string_lossy();
        streams.append_image(&filename, &inputs.catalog, &rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dots::Dot;
    use crate::nuclei::Nucleus;
    use crate::output::{global_join_filename, global_nuclei_filename, partial_filename, read_nuclei_json};
    use crate::overrides::ParamValue;
    use crate::provider::{CsvDotProvider, GeoJsonNucleusProvider};
    use geo::LineString;
    use std::sync::Mutex;

    fn square_catalog() -> NucleusCatalog {
        let polygon = LineString::from(vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]);
        NucleusCatalog::new(vec![Nucleus::from_polygon(0, polygon, None).unwrap()]).unwrap()
    }

    fn dot(x: f64, y: f64) -> Dot {
        Dot {
            x,
            y,
            t: 1,
            c: 1,
            intensity: 250.0,
        }
    }

    fn square_nuclei(_image: &Path, ctx: &AcquireContext) -> Result<NucleusCatalog> {
        ctx.checkpoint()?;
        Ok(square_catalog())
    }

    fn two_dots(_image: &Path, _channel: u32, ctx: &AcquireContext) -> Result<DotTable> {
        ctx.checkpoint()?;
        Ok(DotTable::new(vec![dot(50.0, 50.0), dot(5.0, 5.0)]))
    }

    fn images(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|name| dir.join(name)).collect()
    }

    #[test]
    fn test_config_validation() {
        assert!(AggregatorConfig::new("/data", 4, vec![1, 2, 3]).validate().is_ok());
        assert!(matches!(
            AggregatorConfig::new("/data", 4, vec![]).validate(),
            Err(JoinError::Config(_))
        ));
        assert!(matches!(
            AggregatorConfig::new("/data", 4, vec![1, 4]).validate(),
            Err(JoinError::Config(_))
        ));
        assert!(matches!(
            AggregatorConfig::new("/data", 4, vec![1, 2, 1]).validate(),
            Err(JoinError::Config(_))
        ));
        assert!(StreamingAggregator::new(AggregatorConfig::new("/data", 1, vec![1]), square_nuclei, two_dots).is_err());
    }

    #[test]
    fn test_read_file_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fish_join_file_list");
        fs::write(&path, "/data/a.tif\n\n  /data/b c.tif  \n").unwrap();
        assert_eq!(
            read_file_list(&path).unwrap(),
            vec![PathBuf::from("/data/a.tif"), PathBuf::from("/data/b c.tif")]
        );
        assert!(matches!(
            read_file_list(&dir.path().join("missing")),
            Err(JoinError::MissingInput { .. })
        ));
    }

    #[test]
    fn test_single_image_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = AggregatorConfig::new(dir.path(), 4, vec![1]);
        let dots = |_image: &Path, _channel: u32, _ctx: &AcquireContext| -> Result<DotTable> {
            Ok(DotTable::new(vec![dot(5.0, 5.0), dot(50.0, 50.0)]))
        };
        let aggregator = StreamingAggregator::new(config, square_nuclei, dots).unwrap();
        let image = dir.path().join("sample_MAX.tif");

        let report = aggregator.run(&[&image]).unwrap();
        assert_eq!(report.images_processed, 1);
        assert!(report.skipped.is_empty());
        assert_eq!(report.nuclei_written, 1);
        assert_eq!(report.dots_written, 2);

        let image_join = fs::read_to_string(dir.path().join("sample_MAX_nuclei_dots_joined.csv")).unwrap();
        let lines: Vec<_> = image_join.lines().collect();
        assert_eq!(
            lines,
            vec![
                "x,y,t,c,intensity,nucleus_id,channel",
                "5.0,5.0,1,1,250.0,0,1",
                "50.0,50.0,1,1,250.0,,1",
            ]
        );

        let image_nuclei = read_nuclei_json(&dir.path().join("sample_MAX_nuclei.json")).unwrap();
        assert_eq!(image_nuclei.len(), 1);
        assert_eq!(image_nuclei[0].centroid, [5.0, 5.0]);
        assert_eq!(image_nuclei[0].area, 100.0);
        assert_eq!(image_nuclei[0].filename, None);

        let global_nuclei = read_nuclei_json(&report.global_nuclei_path).unwrap();
        assert_eq!(global_nuclei[0].filename.as_deref(), Some(image.to_str().unwrap()));

        let global_join = fs::read_to_string(&report.global_join_path).unwrap();
        let lines: Vec<_> = global_join.lines().collect();
        assert_eq!(lines[0], "x,y,t,c,intensity,nucleus_id,channel,filename");
        assert_eq!(lines[1], format!("5.0,5.0,1,1,250.0,0,1,{}", image.display()));
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_empty_file_list() {
        let dir = tempfile::tempdir().unwrap();
        let config = AggregatorConfig::new(dir.path(), 4, vec![1, 2]);
        let aggregator = StreamingAggregator::new(config, square_nuclei, two_dots).unwrap();

        let report = aggregator.run::<PathBuf>(&[]).unwrap();
        assert_eq!(report.images_processed, 0);
        assert_eq!(fs::read_to_string(global_nuclei_filename(dir.path())).unwrap(), "[\n]\n");
        assert_eq!(
            fs::read_to_string(global_join_filename(dir.path())).unwrap(),
            "x,y,t,c,intensity,nucleus_id,channel,filename\n"
        );
    }

    #[test]
    fn test_global_line_count() {
        let dir = tempfile::tempdir().unwrap();
        let config = AggregatorConfig::new(dir.path(), 4, vec![1, 2, 3]);
        let dots = |image: &Path, channel: u32, _ctx: &AcquireContext| -> Result<DotTable> {
            // a different number of dots per image and channel
            let n = channel as usize + image.to_string_lossy().len() % 3;
            Ok((0..n).map(|i| dot(i as f64 * 3.0, 1.0)).collect())
        };
        let aggregator = StreamingAggregator::new(config, square_nuclei, dots).unwrap();
        let images = images(dir.path(), &["a.tif", "bb.tif", "ccc.tif"]);

        let expected: usize = images
            .iter()
            .flat_map(|image| [1u32, 2, 3].map(|channel| channel as usize + image.to_string_lossy().len() % 3))
            .sum();

        let report = aggregator.run(&images).unwrap();
        assert_eq!(report.dots_written, expected);

        let global_join = fs::read_to_string(&report.global_join_path).unwrap();
        assert_eq!(global_join.lines().count(), 1 + expected);

        let global_nuclei = read_nuclei_json(&report.global_nuclei_path).unwrap();
        assert_eq!(global_nuclei.len(), 3);
        assert!(global_nuclei.iter().all(|n| n.id == 0));
    }

    #[test]
    fn test_per_image_files_are_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("a.tif");
        fs::write(image_join_filename(&image), "stale,rows\n1,2\n3,4\n5,6\n").unwrap();
        fs::write(global_join_filename(dir.path()), "stale\n").unwrap();

        let config = AggregatorConfig::new(dir.path(), 4, vec![1]);
        let aggregator = StreamingAggregator::new(config, square_nuclei, two_dots).unwrap();
        aggregator.run(&[&image]).unwrap();

        let text = fs::read_to_string(image_join_filename(&image)).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.starts_with("x,y,t,c,intensity,nucleus_id,channel\n"));
        let text = fs::read_to_string(global_join_filename(dir.path())).unwrap();
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_skip_failed_image() {
        let dir = tempfile::tempdir().unwrap();
        let config = AggregatorConfig::new(dir.path(), 4, vec![1, 2]);
        let dots = |image: &Path, channel: u32, _ctx: &AcquireContext| -> Result<DotTable> {
            if image.ends_with("bad.tif") && channel == 2 {
                return Err(JoinError::MissingInput {
                    path: image.with_file_name("bad_C2.csv"),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                });
            }
            Ok(DotTable::new(vec![dot(5.0, 5.0)]))
        };
        let aggregator = StreamingAggregator::new(config, square_nuclei, dots).unwrap();
        let images = images(dir.path(), &["a.tif", "bad.tif", "c.tif"]);

        let report = aggregator.run(&images).unwrap();
        assert_eq!(report.images_processed, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].image, images[1]);
        assert!(matches!(report.skipped[0].error, JoinError::MissingInput { .. }));

        assert!(!image_join_filename(&images[1]).exists());
        assert!(!image_nuclei_filename(&images[1]).exists());
        assert!(image_join_filename(&images[2]).exists());

        let global_join = fs::read_to_string(&report.global_join_path).unwrap();
        assert_eq!(global_join.lines().count(), 1 + 4);
        assert!(!global_join.contains("bad.tif"));

        let global_nuclei = fs::read_to_string(&report.global_nuclei_path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&global_nuclei).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_abort_on_failed_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AggregatorConfig::new(dir.path(), 4, vec![1]);
        config.failure_policy = FailurePolicy::AbortBatch;
        let nuclei = |image: &Path, _ctx: &AcquireContext| -> Result<NucleusCatalog> {
            if image.ends_with("b.tif") {
                return Err(JoinError::InvalidGeoJson {
                    path: image.to_path_buf(),
                    reason: String::from("truncated"),
                });
            }
            Ok(square_catalog())
        };
        let aggregator = StreamingAggregator::new(config, nuclei, two_dots).unwrap();
        let images = images(dir.path(), &["a.tif", "b.tif", "c.tif"]);

        let err = aggregator.run(&images).unwrap_err();
        assert!(matches!(err, JoinError::InvalidGeoJson { .. }));

        // the run stopped at b.tif
        assert!(image_join_filename(&images[0]).exists());
        assert!(!image_join_filename(&images[2]).exists());

        // and left only partial global files behind
        let nuclei_path = global_nuclei_filename(dir.path());
        assert!(!nuclei_path.exists());
        assert!(!global_join_filename(dir.path()).exists());
        let partial = fs::read_to_string(partial_filename(&nuclei_path)).unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(&partial).is_err());
    }

    #[test]
    fn test_cancel_stops_batch() {
        let dir = tempfile::tempdir().unwrap();
        let config = AggregatorConfig::new(dir.path(), 4, vec![1]);
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let nuclei = move |image: &Path, _ctx: &AcquireContext| -> Result<NucleusCatalog> {
            if image.ends_with("b.tif") {
                trigger.cancel();
            }
            Ok(square_catalog())
        };
        let aggregator = StreamingAggregator::new(config, nuclei, two_dots)
            .unwrap()
            .with_cancel_token(cancel);
        let images = images(dir.path(), &["a.tif", "b.tif", "c.tif"]);

        // cancellation is never skipped, whatever the failure policy
        assert!(matches!(aggregator.run(&images), Err(JoinError::Cancelled)));
        assert!(image_join_filename(&images[0]).exists());
        assert!(!image_join_filename(&images[1]).exists());
        assert!(!global_join_filename(dir.path()).exists());
    }

    #[test]
    fn test_timeout_skips_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AggregatorConfig::new(dir.path(), 4, vec![1]);
        config.acquire_timeout = Some(Duration::ZERO);
        let aggregator = StreamingAggregator::new(config, square_nuclei, two_dots).unwrap();
        let images = images(dir.path(), &["a.tif"]);

        let report = aggregator.run(&images).unwrap();
        assert_eq!(report.images_processed, 0);
        assert!(matches!(report.skipped[0].error, JoinError::TimedOut { .. }));
        assert_eq!(fs::read_to_string(&report.global_nuclei_path).unwrap(), "[\n]\n");
    }

    #[test]
    fn test_overrides_reach_providers() {
        let dir = tempfile::tempdir().unwrap();
        let (overrides, diagnostics) = PerFileOverrides::from_reader(
            "filename,ch4:threshold,ch2:sigma\na.tif,150,1.25\n".as_bytes(),
            Path::new("params.csv"),
            dir.path(),
            4,
            &[1, 2],
        )
        .unwrap();
        assert!(diagnostics.is_empty());

        let seen = Mutex::new(Vec::new());
        let nuclei = |image: &Path, ctx: &AcquireContext| -> Result<NucleusCatalog> {
            let threshold = ctx.nuclei_params().and_then(|p| p.get("threshold").cloned());
            seen.lock().unwrap().push((image.to_path_buf(), 0, threshold));
            Ok(square_catalog())
        };
        let dots = |image: &Path, channel: u32, ctx: &AcquireContext| -> Result<DotTable> {
            let sigma = ctx.dot_params(channel).and_then(|p| p.get("sigma").cloned());
            seen.lock().unwrap().push((image.to_path_buf(), channel, sigma));
            Ok(DotTable::default())
        };

        let config = AggregatorConfig::new(dir.path(), 4, vec![1, 2]);
        let aggregator = StreamingAggregator::new(config, nuclei, dots)
            .unwrap()
            .with_overrides(overrides);
        let images = images(dir.path(), &["a.tif", "b.tif"]);
        aggregator.run(&images).unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (images[0].clone(), 0, Some(ParamValue::Int(150))),
                (images[0].clone(), 1, None),
                (images[0].clone(), 2, Some(ParamValue::Float(1.25))),
                (images[1].clone(), 0, None),
                (images[1].clone(), 1, None),
                (images[1].clone(), 2, None),
            ]
        );
    }

    #[test]
    fn test_input_row_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AggregatorConfig::new(dir.path(), 4, vec![1]);
        config.row_order = RowOrder::InputOrder;
        let aggregator = StreamingAggregator::new(config, square_nuclei, two_dots).unwrap();
        let image = dir.path().join("a.tif");
        aggregator.run(&[&image]).unwrap();

        let text = fs::read_to_string(image_join_filename(&image)).unwrap();
        let ids: Vec<_> = text.lines().skip(1).map(|l| l.split(',').nth(5).unwrap().to_string()).collect();
        assert_eq!(ids, vec!["", "0"]);
    }

    #[test]
    fn test_skipped_image_loses_previous_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("s1.tif");
        let table = dir.path().join("s1_C1.csv");
        fs::write(&table, "x,y,t,c,intensity\n5,5,1,1,100\n").unwrap();

        let config = AggregatorConfig::new(dir.path(), 3, vec![1]);
        let aggregator = StreamingAggregator::new(config, square_nuclei, CsvDotProvider::new()).unwrap();

        let report = aggregator.run(&[&image]).unwrap();
        assert_eq!(report.images_processed, 1);
        assert!(image_nuclei_filename(&image).exists());
        assert!(image_join_filename(&image).exists());

        fs::remove_file(&table).unwrap();
        let report = aggregator.run(&[&image]).unwrap();
        assert_eq!(report.images_processed, 0);
        assert_eq!(report.skipped.len(), 1);
        assert!(!image_nuclei_filename(&image).exists());
        assert!(!image_join_filename(&image).exists());
        assert_eq!(fs::read_to_string(&report.global_join_path).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_first_image_without_nuclei() {
        let dir = tempfile::tempdir().unwrap();
        let config = AggregatorConfig::new(dir.path(), 4, vec![1]);
        let nuclei = |image: &Path, _ctx: &AcquireContext| -> Result<NucleusCatalog> {
            if image.ends_with("empty.tif") {
                Ok(NucleusCatalog::default())
            } else {
                Ok(square_catalog())
            }
        };
        let aggregator = StreamingAggregator::new(config, nuclei, two_dots).unwrap();
        let images = images(dir.path(), &["empty.tif", "a.tif", "b.tif"]);

        let report = aggregator.run(&images).unwrap();
        assert_eq!(report.nuclei_written, 2);
        assert_eq!(fs::read_to_string(image_nuclei_filename(&images[0])).unwrap(), "[\n]\n");

        let text = fs::read_to_string(&report.global_nuclei_path).unwrap();
        assert!(text.starts_with("[\n{\"id\":0,"));
        assert!(text.ends_with("}]\n"));
        let records = read_nuclei_json(&report.global_nuclei_path).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].filename.as_deref().unwrap().ends_with("a.tif"));
    }

    #[test]
    fn test_file_backed_batch() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        fs::create_dir(base.join("well1")).unwrap();

        let geojson = r#"{"type": "FeatureCollection", "features": [
            {"type": "Feature",
             "nucleusGeometry": {"type": "Polygon", "coordinates": [[[0, 0], [10, 0], [10, 10], [0, 10], [0, 0]]]},
             "properties": {"objectType": "cell", "measurements": {"Nucleus: Area": 100.0}}},
            {"type": "Feature",
             "nucleusGeometry": {"type": "Polygon", "coordinates": [[[3, 3], [3, 3], [3, 3]]]},
             "properties": {"objectType": "cell", "measurements": {"Nucleus: Area": 0.0}}},
            {"type": "Feature",
             "nucleusGeometry": {"type": "Polygon", "coordinates": [[[20, 0], [30, 0], [30, 10], [20, 10], [20, 0]]]},
             "properties": {"objectType": "cell", "measurements": {"Nucleus: Area": 100.0}}}
        ]}"#;
        for name in ["s1", "s2"] {
            fs::write(base.join("well1").join(format!("{name}_nuclei.geojson")), geojson).unwrap();
            fs::write(
                base.join("well1").join(format!("{name}_C1.csv")),
                "x,y,t,c,intensity\n25,5,1,1,900\n5,5,1,1,800\n99,99,1,1,700\n",
            )
            .unwrap();
            fs::write(
                base.join("well1").join(format!("{name}_C2.csv")),
                "x,y,t,c,intensity\n1,1,1,1,400\n",
            )
            .unwrap();
        }

        let list = base.join("fish_join_file_list");
        fs::write(
            &list,
            format!(
                "{}\n{}\n{}\n",
                base.join("well1/s1.tif").display(),
                base.join("well1/missing.tif").display(),
                base.join("well1/s2.tif").display()
            ),
        )
        .unwrap();

        let config = AggregatorConfig::new(base, 3, vec![1, 2]);
        let aggregator =
            StreamingAggregator::new(config, GeoJsonNucleusProvider::new(), CsvDotProvider::new()).unwrap();
        let report = aggregator.run_file_list(&list).unwrap();

        assert_eq!(report.images_processed, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.nuclei_written, 4);
        assert_eq!(report.dots_written, 8);

        // the degenerate nucleus still used up id 1
        let nuclei = read_nuclei_json(&report.global_nuclei_path).unwrap();
        let ids: Vec<_> = nuclei.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![0, 2, 0, 2]);
        assert!(nuclei[3].filename.as_deref().unwrap().ends_with("s2.tif"));

        assert_eq!(report.feature_diagnostics.len(), 2);
        for ((image, error), name) in report.feature_diagnostics.iter().zip(["s1.tif", "s2.tif"]) {
            assert!(image.ends_with(name));
            assert!(matches!(error, JoinError::DegeneratePolygon { id: 1 }));
        }

        let text = fs::read_to_string(base.join("well1/s1_nuclei_dots_joined.csv")).unwrap();
        let keys: Vec<_> = text
            .lines()
            .skip(1)
            .map(|l| {
                let fields: Vec<_> = l.split(',').collect();
                (fields[5].to_string(), fields[6].to_string())
            })
            .collect();
        assert_eq!(
            keys,
            vec![
                (String::from("0"), String::from("1")),
                (String::from("0"), String::from("2")),
                (String::from("2"), String::from("1")),
                (String::new(), String::from("1")),
            ]
        );
    }
}
