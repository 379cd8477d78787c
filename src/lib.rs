pub mod aggregator;
pub mod dots;
pub mod error;
pub mod geometry;
pub mod join;
pub mod nuclei;
pub mod output;
pub mod overrides;
pub mod provider;
pub mod schemas;

pub use aggregator::{AggregatorConfig, BatchReport, FailurePolicy, SkippedImage, StreamingAggregator};
pub use dots::{Dot, DotTable};
pub use error::{JoinError, Result};
pub use join::{join_image, JoinedDot, RowOrder};
pub use nuclei::{Nucleus, NucleusCatalog, NucleusId};
pub use overrides::PerFileOverrides;
pub use provider::{AcquireContext, CancelToken, CsvDotProvider, DotProvider, GeoJsonNucleusProvider, NucleusProvider};
