//! Nuclei segmentation, tracking and per-cell statistics for OME-Zarr plates.

pub mod assignment;
pub mod error;
pub mod forest;
pub mod infection;
pub mod metadata;
pub mod metric;
pub mod pipeline;
pub mod pyramid;
pub mod segmenter;
pub mod selection;
pub mod stats;
pub mod threshold;
pub mod tracker;
pub mod volume;
pub mod zarr;

pub use error::{Error, Result};
pub use metadata::{describe_dataset, DatasetMetadata, PositionMetadata, ScaleLayout};
pub use metric::{MatchStrategy, VoxelSpacing};
pub use pipeline::{track_position, LabelSink, PipelineConfig, PositionSource};
pub use segmenter::{OtsuSegmenter, Segmenter};
pub use stats::{extract, extract_plate_stats, StatsTable};
pub use tracker::{track, TrackParams, TrackState};
pub use volume::LabelVolume;
