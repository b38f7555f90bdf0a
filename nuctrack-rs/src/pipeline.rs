//! Segment-and-track pass over the positions of a plate.
//!
//! Every position is processed on its own: frames are read in time order,
//! normalized, segmented, relabeled by the tracker and written as one chunk
//! of a `(T, 1, Z, Y, X)` uint32 label array next to the image. Any level of
//! the image pyramid can be segmented; the labels take that level's size.

use clap::{Args, ValueEnum};
use ndarray::{Array3, Axis};
use serde_json::{json, Map, Value};
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::metadata::{describe_dataset, PositionMetadata};
use crate::metric::{MatchStrategy, VoxelSpacing};
use crate::segmenter::{OtsuSegmenter, Segmenter, SegmenterKind};
use crate::selection::select_positions;
use crate::tracker::{TrackParams, TrackState};
use crate::volume::{normalize_in_place, LabelVolume};
use crate::zarr::{self, ImageDtype, Store, StoreArray};

/// Default name of the label array written under each position.
pub const DEFAULT_SEG_NAME: &str = "nuclei_segmentation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyKind {
    /// Intersection-over-union of the voxel masks
    Overlap,
    /// Physical centroid distance
    Distance,
}

#[derive(Args, Clone)]
pub struct SegmentArgs {
    /// Path to the OME-Zarr plate
    #[arg(long)]
    pub input: String,
    /// Channel index holding the nuclear stain
    #[arg(long, default_value_t = 0)]
    pub channel: usize,
    /// Resolution level to segment (0 = full resolution)
    #[arg(long, default_value_t = 0)]
    pub level: usize,
    #[arg(long, value_enum, default_value_t = SegmenterKind::Otsu)]
    pub segmenter: SegmenterKind,
    /// Path to model directory containing model.onnx (cellpose only)
    #[arg(long)]
    pub model: Option<String>,
    /// Force CPU (skip CUDA)
    #[arg(long)]
    pub cpu: bool,
    /// Batch size for ONNX inference
    #[arg(long, default_value_t = 1)]
    pub batch_size: usize,
    /// IoU needed to join cellpose masks of neighbouring Z planes
    #[arg(long, default_value_t = 0.25)]
    pub stitch_threshold: f64,
    /// Drop otsu components smaller than this many voxels
    #[arg(long, default_value_t = 1)]
    pub min_size: usize,
    #[arg(long, value_enum, default_value_t = StrategyKind::Overlap)]
    pub strategy: StrategyKind,
    /// Overlap tracking: minimum IoU to continue an identity
    #[arg(long, default_value_t = 0.1)]
    pub min_iou: f64,
    /// Distance tracking: maximum centroid displacement, physical units
    #[arg(long, default_value_t = 50.0)]
    pub max_dist: f64,
    /// Voxel spacing "z,y,x"; defaults to the image's scale metadata
    #[arg(long)]
    pub spacing: Option<String>,
    /// Name of the label array written under each position
    #[arg(long, default_value = DEFAULT_SEG_NAME)]
    pub seg_name: String,
    /// Positions to process: "all", indices, start:stop[:step] or ids like A/1/0
    #[arg(long, default_value = "all")]
    pub positions: String,
    /// Log failing positions and continue with the rest
    #[arg(long)]
    pub keep_going: bool,
}

/// Read access to the image of one position.
pub trait PositionSource {
    /// `[t, c, z, y, x]` sizes.
    fn dims(&self) -> [usize; 5];

    /// The `(z, y, x)` volume of channel `c` at time `t`.
    fn read_volume(&self, t: usize, c: usize) -> Result<Array3<f32>>;
}

/// Destination for tracked label frames.
pub trait LabelSink {
    fn write_labels(&mut self, t: usize, labels: &LabelVolume) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    pub channel: usize,
    pub track: TrackParams,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionSummary {
    pub frames: usize,
    /// Distinct identities issued over the whole time series.
    pub identities: u32,
}

/// One resolution level of a position's image in a filesystem store.
pub struct ZarrPosition {
    array: StoreArray,
    dtype: ImageDtype,
    dims: [usize; 5],
}

impl ZarrPosition {
    pub fn open(store: &Store, position: &PositionMetadata) -> Result<Self> {
        Self::open_level(store, position, 0)
    }

    pub fn open_level(store: &Store, position: &PositionMetadata, level: usize) -> Result<Self> {
        let dims = position.level_tczyx(level)?;
        let level = position.level(level)?;
        let dtype = ImageDtype::parse(&level.dtype)?;
        let array = zarr::open_array(store, &format!("/{}/{}", position.path, level.path))?;
        Ok(Self { array, dtype, dims })
    }
}

impl PositionSource for ZarrPosition {
    fn dims(&self) -> [usize; 5] {
        self.dims
    }

    fn read_volume(&self, t: usize, c: usize) -> Result<Array3<f32>> {
        let [_, _, z, y, x] = self.dims;
        zarr::read_volume_f32(&self.array, self.dtype, t as u64, c as u64, (z, y, x))
    }
}

/// Label array `(T, 1, Z, Y, X)` with one chunk per frame.
pub struct ZarrLabels {
    array: StoreArray,
}

impl ZarrLabels {
    pub fn create(
        store: &Store,
        position: &PositionMetadata,
        seg_name: &str,
        dims: [usize; 5],
        attrs: Map<String, Value>,
    ) -> Result<Self> {
        let [t, _, z, y, x] = dims.map(|d| d as u64);
        let array = zarr::create_array_u32(
            store,
            &format!("/{}/{}", position.path, seg_name),
            vec![t, 1, z, y, x],
            vec![1, 1, z, y, x],
            Some(attrs),
        )?;
        Ok(Self { array })
    }
}

impl LabelSink for ZarrLabels {
    fn write_labels(&mut self, t: usize, labels: &LabelVolume) -> Result<()> {
        let data: Vec<u32> = labels.iter().copied().collect();
        zarr::store_chunk_u32(&self.array, &[t as u64, 0, 0, 0, 0], &data)
    }
}

/// Segment and track every frame of one position. Stops at the first error;
/// frames before it have already been written.
pub fn track_position<S, K>(
    source: &S,
    sink: &mut K,
    segmenter: &mut dyn Segmenter,
    config: &PipelineConfig,
    progress: impl Fn(f64, &str),
) -> Result<PositionSummary>
where
    S: PositionSource + ?Sized,
    K: LabelSink + ?Sized,
{
    let [n_t, n_c, z, y, x] = source.dims();
    if config.channel >= n_c {
        return Err(Error::Config(format!(
            "channel {} out of range (image has {n_c} channels)",
            config.channel
        )));
    }

    let mut state = TrackState::new();
    for t in 0..n_t {
        let mut volume = source.read_volume(t, config.channel)?;
        normalize_in_place(volume.view_mut());
        let volume = volume.insert_axis(Axis(0));

        let labels = segmenter
            .segment(volume.view())
            .map_err(|e| match e {
                Error::Segmentation(msg) => Error::Segmentation(format!("t={t}: {msg}")),
                other => other,
            })?;
        if labels.dim() != (z, y, x) {
            return Err(Error::ShapeMismatch {
                expected: vec![z, y, x],
                found: labels.shape().to_vec(),
            });
        }

        let tracked = state.advance(&labels, &config.track)?;
        sink.write_labels(t, tracked)?;
        let objects = crate::volume::object_records(tracked.view()).len();
        log::debug!("t={t}: {objects} objects, next identity {}", state.next_identity());
        progress((t + 1) as f64 / n_t as f64, &format!("Frame {}/{}", t + 1, n_t));
    }

    Ok(PositionSummary {
        frames: n_t,
        identities: state.next_identity() - crate::tracker::FIRST_IDENTITY,
    })
}

fn parse_spacing(s: &str) -> Result<VoxelSpacing> {
    let parts: Vec<f64> = s
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::Config(format!("invalid spacing {s:?}, expected \"z,y,x\"")))?;
    match parts[..] {
        [z, y, x] if parts.iter().all(|v| v.is_finite() && *v > 0.0) => {
            Ok(VoxelSpacing::new(z, y, x))
        }
        _ => Err(Error::Config(format!(
            "invalid spacing {s:?}, expected three positive numbers"
        ))),
    }
}

fn track_params(args: &SegmentArgs, spacing: Option<VoxelSpacing>) -> TrackParams {
    let strategy = match args.strategy {
        StrategyKind::Overlap => MatchStrategy::Overlap {
            min_iou: args.min_iou,
        },
        StrategyKind::Distance => MatchStrategy::Distance {
            max_dist: args.max_dist,
            spacing: spacing.unwrap_or_default(),
        },
    };
    TrackParams { strategy }
}

fn build_segmenter(args: &SegmentArgs) -> Result<Box<dyn Segmenter>> {
    match args.segmenter {
        SegmenterKind::Otsu => Ok(Box::new(OtsuSegmenter {
            min_size: args.min_size,
        })),
        #[cfg(feature = "cellpose")]
        SegmenterKind::Cellpose => {
            let model = args
                .model
                .as_deref()
                .ok_or_else(|| Error::Config("--model is required for cellpose".into()))?;
            Ok(Box::new(crate::segmenter::CellposeSegmenter::new(
                std::path::Path::new(model),
                args.cpu,
                args.batch_size,
                args.stitch_threshold,
            )?))
        }
        #[cfg(not(feature = "cellpose"))]
        SegmenterKind::Cellpose => Err(Error::Config(
            "nuctrack was built without the cellpose feature".into(),
        )),
    }
}

fn label_attributes(
    segmenter: &str,
    level: usize,
    config: &PipelineConfig,
) -> Result<Map<String, Value>> {
    let mut attrs = Map::new();
    attrs.insert(
        "nuctrack".into(),
        json!({
            "axis_names": ["t", "c", "z", "y", "x"],
            "segmenter": segmenter,
            "source_channel": config.channel,
            "source_level": level,
            "tracking": serde_json::to_value(config.track)?,
        }),
    );
    Ok(attrs)
}

pub fn run(args: SegmentArgs, progress: impl Fn(f64, &str)) -> Result<()> {
    if !(0.0..=1.0).contains(&args.min_iou) {
        return Err(Error::Config(format!("min_iou {} not in [0, 1]", args.min_iou)));
    }
    if args.max_dist.is_nan() || args.max_dist <= 0.0 {
        return Err(Error::Config(format!("max_dist {} must be positive", args.max_dist)));
    }
    let cli_spacing = args.spacing.as_deref().map(parse_spacing).transpose()?;

    let root = PathBuf::from(&args.input);
    let meta = describe_dataset(&root)?;
    let positions: Vec<&PositionMetadata> = meta.positions().collect();
    let ids: Vec<String> = positions.iter().map(|p| p.id()).collect();
    let selected = select_positions(&args.positions, &ids)?;

    for &i in &selected {
        let [_, n_c, ..] = positions[i].level_tczyx(args.level)?;
        if args.channel >= n_c {
            return Err(Error::Config(format!(
                "channel {} out of range for {} ({n_c} channels)",
                args.channel, ids[i]
            )));
        }
    }

    let mut segmenter = build_segmenter(&args)?;
    let store = zarr::open_store(&root)?;
    let total = selected.len();
    let mut failed = Vec::new();

    for (k, &i) in selected.iter().enumerate() {
        let position = positions[i];
        let config = PipelineConfig {
            channel: args.channel,
            track: track_params(
                &args,
                cli_spacing.or_else(|| position.level(args.level).ok()?.voxel_spacing()),
            ),
        };
        log::info!("{}: segmenting with {}", ids[i], segmenter.name());

        let result = process_position(
            &store,
            position,
            args.level,
            &args.seg_name,
            segmenter.as_mut(),
            &config,
            |p, msg| progress((k as f64 + p) / total as f64, &format!("{} {msg}", ids[i])),
        );
        match result {
            Ok(summary) => log::info!(
                "{}: {} frames, {} identities",
                ids[i],
                summary.frames,
                summary.identities
            ),
            Err(e) if args.keep_going => {
                log::warn!("{}: skipped after error: {e}", ids[i]);
                failed.push(ids[i].clone());
            }
            Err(e) => return Err(e),
        }
    }

    if !failed.is_empty() {
        return Err(Error::PositionsFailed(failed));
    }
    progress(1.0, &format!("Segmented {total} position(s)"));
    Ok(())
}

fn process_position(
    store: &Store,
    position: &PositionMetadata,
    level: usize,
    seg_name: &str,
    segmenter: &mut dyn Segmenter,
    config: &PipelineConfig,
    progress: impl Fn(f64, &str),
) -> Result<PositionSummary> {
    let source = ZarrPosition::open_level(store, position, level)?;
    let attrs = label_attributes(segmenter.name(), level, config)?;
    let mut sink = ZarrLabels::create(store, position, seg_name, source.dims(), attrs)?;
    track_position(&source, &mut sink, segmenter, config, progress)
}


#[cfg(test)]
mod tests {
    use super::memory::*;
    use super::*;
    use ndarray::{Array5, ArrayView4};
    use std::cell::Cell;

    /// A bright 2x2 nucleus drifting one pixel right per frame.
    fn drifting_nucleus(frames: usize) -> Array5<f32> {
        let mut image = Array5::<f32>::from_elem((frames, 2, 1, 6, 8), 100.0);
        for t in 0..frames {
            for (y, x) in [(2, 1), (2, 2), (3, 1), (3, 2)] {
                image[[t, 0, 0, y, x + t]] = 1000.0;
            }
        }
        image
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            channel: 0,
            track: TrackParams::default(),
        }
    }

    struct FailingAt {
        t: usize,
        calls: usize,
        inner: OtsuSegmenter,
    }

    impl Segmenter for FailingAt {
        fn name(&self) -> &str {
            "failing"
        }

        fn segment(&mut self, volume: ArrayView4<'_, f32>) -> Result<LabelVolume> {
            let call = self.calls;
            self.calls += 1;
            if call == self.t {
                return Err(Error::Segmentation("model crashed".into()));
            }
            self.inner.segment(volume)
        }
    }

    #[test]
    fn identity_survives_drift() {
        let source = MemorySource {
            image: drifting_nucleus(3),
        };
        let mut sink = MemorySink::default();
        let summary = track_position(
            &source,
            &mut sink,
            &mut OtsuSegmenter::default(),
            &config(),
            |_, _| {},
        )
        .unwrap();

        assert_eq!(summary, PositionSummary { frames: 3, identities: 1 });
        assert_eq!(sink.frames.len(), 3);
        for (t, labels) in &sink.frames {
            assert_eq!(labels[[0, 2, 1 + t]], 1);
            assert_eq!(labels.iter().filter(|&&v| v == 1).count(), 4);
        }
    }

    #[test]
    fn segmenter_failure_stops_after_written_frames() {
        let source = MemorySource {
            image: drifting_nucleus(3),
        };
        let mut sink = MemorySink::default();
        let mut segmenter = FailingAt {
            t: 1,
            calls: 0,
            inner: OtsuSegmenter::default(),
        };
        let err = track_position(&source, &mut sink, &mut segmenter, &config(), |_, _| {})
            .unwrap_err();

        assert!(matches!(err, Error::Segmentation(msg) if msg.contains("t=1")));
        assert_eq!(sink.frames.len(), 1);
        assert_eq!(sink.frames[0].0, 0);
    }

    #[test]
    fn out_of_range_channel_is_rejected_before_reading() {
        let source = MemorySource {
            image: drifting_nucleus(1),
        };
        let mut sink = MemorySink::default();
        let cfg = PipelineConfig {
            channel: 2,
            ..config()
        };
        let err = track_position(&source, &mut sink, &mut OtsuSegmenter::default(), &cfg, |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(sink.frames.is_empty());
    }

    #[test]
    fn progress_reaches_one() {
        let source = MemorySource {
            image: drifting_nucleus(2),
        };
        let last = Cell::new(0.0);
        track_position(
            &source,
            &mut MemorySink::default(),
            &mut OtsuSegmenter::default(),
            &config(),
            |p, _| last.set(p),
        )
        .unwrap();
        assert_eq!(last.get(), 1.0);
    }

    #[test]
    fn spacing_parsing() {
        assert_eq!(parse_spacing("2, 0.5,0.5").unwrap(), VoxelSpacing::new(2.0, 0.5, 0.5));
        assert!(parse_spacing("1,1").is_err());
        assert!(parse_spacing("1,0,1").is_err());
        assert!(parse_spacing("a,b,c").is_err());
    }

    #[test]
    fn label_attributes_record_tracking() {
        let attrs = label_attributes("otsu", 1, &config()).unwrap();
        let block = &attrs["nuctrack"];
        assert_eq!(block["segmenter"], "otsu");
        assert_eq!(block["source_level"], 1);
        assert_eq!(block["tracking"]["strategy"], "overlap");
        assert_eq!(block["tracking"]["min_iou"], 0.1);
    }
}
