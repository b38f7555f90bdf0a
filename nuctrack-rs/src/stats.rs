//! Per-object region statistics over tracked label arrays.
//!
//! One row per (time, label) with morphology, centroid and per-channel
//! intensity summaries. Tables are plain numeric columns so they can be
//! written to CSV and extended by downstream steps such as the infection
//! heuristic.

use clap::Args;
use ndarray::{Array4, ArrayView3, ArrayView4, Axis};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::metadata::{describe_dataset, read_level, PositionMetadata};
use crate::pipeline::{PositionSource, ZarrPosition, DEFAULT_SEG_NAME};
use crate::selection::select_positions;
use crate::volume::{IntensityVolume, LabelVolume};
use crate::zarr::{self, ImageDtype};

#[derive(Args, Clone)]
pub struct StatsArgs {
    /// Path to the OME-Zarr plate
    #[arg(long)]
    pub input: String,
    /// Name of the label array under each position
    #[arg(long, default_value = DEFAULT_SEG_NAME)]
    pub seg_name: String,
    /// Directory for <well>/<position>_stats.csv files
    #[arg(long)]
    pub output: String,
    /// Positions to process: "all", indices, start:stop[:step] or ids like A/1/0
    #[arg(long, default_value = "all")]
    pub positions: String,
}

/// Column-named numeric table, rows in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl StatsTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| Error::Config(format!("unknown column {name:?}")))
    }

    pub fn column(&self, name: &str) -> Result<Vec<f64>> {
        let i = self.column_index(name)?;
        Ok(self.rows.iter().map(|r| r[i]).collect())
    }

    /// Append a column, replacing one of the same name.
    pub fn add_column(&mut self, name: &str, values: Vec<f64>) -> Result<()> {
        if values.len() != self.rows.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![self.rows.len()],
                found: vec![values.len()],
            });
        }
        match self.column_index(name) {
            Ok(i) => {
                for (row, v) in self.rows.iter_mut().zip(values) {
                    row[i] = v;
                }
            }
            Err(_) => {
                self.columns.push(name.to_string());
                for (row, v) in self.rows.iter_mut().zip(values) {
                    row.push(v);
                }
            }
        }
        Ok(())
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row.iter().map(f64::to_string))?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let columns: Vec<String> = reader.headers()?.iter().map(String::from).collect();
        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let row = record
                .iter()
                .map(|field| {
                    field.trim().parse::<f64>().map_err(|_| {
                        Error::Config(format!(
                            "{}: row {}: non-numeric value {field:?}",
                            path.display(),
                            line + 1
                        ))
                    })
                })
                .collect::<Result<Vec<f64>>>()?;
            rows.push(row);
        }
        Ok(Self { columns, rows })
    }
}

struct Region {
    area: u64,
    sum: [f64; 3],
    lo: [usize; 3],
    hi: [usize; 3],
    intensity_sum: Vec<f64>,
    intensity_max: Vec<f64>,
    intensity_min: Vec<f64>,
}

impl Region {
    fn new(n_channels: usize, at: [usize; 3]) -> Self {
        Self {
            area: 0,
            sum: [0.0; 3],
            lo: at,
            hi: at,
            intensity_sum: vec![0.0; n_channels],
            intensity_max: vec![f64::NEG_INFINITY; n_channels],
            intensity_min: vec![f64::INFINITY; n_channels],
        }
    }
}

fn index_columns(n_channels: usize) -> Vec<String> {
    let mut columns: Vec<String> = ["label", "area", "centroid-0", "centroid-1", "centroid-2"]
        .into_iter()
        .map(String::from)
        .collect();
    for stat in ["mean_intensity", "max_intensity", "min_intensity"] {
        columns.extend((0..n_channels).map(|c| format!("{stat}-{c}")));
    }
    columns.push("extent".into());
    columns.push("time".into());
    columns
}

/// Accumulates per-frame region rows one timepoint at a time.
pub struct StatsBuilder {
    n_channels: usize,
    table: StatsTable,
}

impl StatsBuilder {
    pub fn new(n_channels: usize) -> Self {
        Self {
            n_channels,
            table: StatsTable::new(index_columns(n_channels)),
        }
    }

    /// Add the regions of one frame. `intensity` is `(c, z, y, x)`.
    pub fn add_frame(
        &mut self,
        time: usize,
        labels: ArrayView3<'_, u32>,
        intensity: ArrayView4<'_, f32>,
    ) -> Result<()> {
        let n_c = self.n_channels;
        if intensity.len_of(Axis(0)) != n_c || intensity.shape()[1..] != *labels.shape() {
            let mut expected = vec![n_c];
            expected.extend_from_slice(labels.shape());
            return Err(Error::ShapeMismatch {
                expected,
                found: intensity.shape().to_vec(),
            });
        }

        let mut regions: BTreeMap<u32, Region> = BTreeMap::new();
        for ((z, y, x), &label) in labels.indexed_iter() {
            if label == 0 {
                continue;
            }
            let at = [z, y, x];
            let r = regions.entry(label).or_insert_with(|| Region::new(n_c, at));
            r.area += 1;
            for d in 0..3 {
                r.sum[d] += at[d] as f64;
                r.lo[d] = r.lo[d].min(at[d]);
                r.hi[d] = r.hi[d].max(at[d]);
            }
            for c in 0..n_c {
                let v = intensity[[c, z, y, x]] as f64;
                r.intensity_sum[c] += v;
                r.intensity_max[c] = r.intensity_max[c].max(v);
                r.intensity_min[c] = r.intensity_min[c].min(v);
            }
        }

        for (label, r) in regions {
            let n = r.area as f64;
            let bbox: usize = (0..3).map(|d| r.hi[d] - r.lo[d] + 1).product();
            let mut row = Vec::with_capacity(self.table.columns.len());
            row.push(label as f64);
            row.push(n);
            row.extend(r.sum.iter().map(|s| s / n));
            row.extend(r.intensity_sum.iter().map(|s| s / n));
            row.extend(r.intensity_max);
            row.extend(r.intensity_min);
            row.push(n / bbox as f64);
            row.push(time as f64);
            self.table.rows.push(row);
        }
        Ok(())
    }

    /// Finish the table, naming intensity columns after `channel_names`.
    pub fn finish(self, channel_names: &[String]) -> Result<StatsTable> {
        if channel_names.len() != self.n_channels {
            return Err(Error::Config(format!(
                "{} channel names for {} channels",
                channel_names.len(),
                self.n_channels
            )));
        }
        rename_channel_columns(self.table, channel_names)
    }
}

/// Region statistics for a tracked time series. `intensity_per_t[t]` is the
/// `(c, z, y, x)` image matching `labels_per_t[t]`.
pub fn extract(
    labels_per_t: &[LabelVolume],
    intensity_per_t: &[IntensityVolume],
    channel_names: &[String],
) -> Result<StatsTable> {
    if labels_per_t.len() != intensity_per_t.len() {
        return Err(Error::ShapeMismatch {
            expected: vec![labels_per_t.len()],
            found: vec![intensity_per_t.len()],
        });
    }
    let mut builder = StatsBuilder::new(channel_names.len());
    for (t, (labels, intensity)) in labels_per_t.iter().zip(intensity_per_t).enumerate() {
        builder.add_frame(t, labels.view(), intensity.view())?;
    }
    builder.finish(channel_names)
}

const CHANNEL_COLUMN_RE: &str = r"^(.+_intensity)-(\d+)$";

/// `mean_intensity-0` -> `mean_intensity-DAPI`. Centroid columns keep their
/// axis index.
pub fn rename_channel_columns(
    mut table: StatsTable,
    channel_names: &[String],
) -> Result<StatsTable> {
    let pattern = Regex::new(CHANNEL_COLUMN_RE)?;
    for column in &mut table.columns {
        let renamed = pattern.captures(column).and_then(|caps| {
            let index: usize = caps[2].parse().ok()?;
            let name = channel_names.get(index)?;
            Some(format!("{}-{name}", &caps[1]))
        });
        if let Some(renamed) = renamed {
            *column = renamed;
        }
    }
    Ok(table)
}

/// Stats of one position of a plate.
#[derive(Debug, Clone)]
pub struct PositionStats {
    pub well: String,
    pub position: String,
    pub table: StatsTable,
}

impl PositionStats {
    pub fn csv_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.well).join(format!("{}_stats.csv", self.position))
    }
}

fn position_stats(
    root: &Path,
    store: &zarr::Store,
    position: &PositionMetadata,
    seg_name: &str,
) -> Result<StatsTable> {
    if !root.join(&position.path).join(seg_name).join("zarr.json").exists() {
        return Err(Error::Config(format!(
            "position {} has no segmentation {seg_name:?}",
            position.id()
        )));
    }
    let seg = read_level(root, &position.path, seg_name)?;
    // Labels may come from a downsampled level; read intensities at that size.
    let level = position
        .layout
        .levels()
        .iter()
        .position(|l| l.shape.len() == 5 && seg.shape.len() == 5 && l.shape[2..] == seg.shape[2..])
        .unwrap_or(0);
    let image = ZarrPosition::open_level(store, position, level)?;
    let [n_t, n_c, z, y, x] = image.dims();

    let expected = vec![n_t as u64, 1, z as u64, y as u64, x as u64];
    if seg.shape != expected {
        return Err(Error::ShapeMismatch {
            expected: expected.iter().map(|&d| d as usize).collect(),
            found: seg.shape.iter().map(|&d| d as usize).collect(),
        });
    }
    let seg_dtype = ImageDtype::parse(&seg.dtype)?;
    let seg_array = zarr::open_array(store, &format!("/{}/{}", position.path, seg_name))?;

    let mut builder = StatsBuilder::new(n_c);
    for t in 0..n_t {
        let labels = zarr::read_labels(&seg_array, seg_dtype, t as u64, (z, y, x))?;
        let mut intensity = Array4::<f32>::zeros((n_c, z, y, x));
        for c in 0..n_c {
            intensity
                .index_axis_mut(Axis(0), c)
                .assign(&image.read_volume(t, c)?);
        }
        builder.add_frame(t, labels.view(), intensity.view())?;
        log::debug!("{} t={t}: {} rows so far", position.id(), builder.table.len());
    }
    builder.finish(&position.channel_names())
}

/// Stats for the selected positions of a plate. With `out_dir`, each table is
/// also written to `<out_dir>/<well>/<position>_stats.csv`.
pub fn extract_plate_stats(
    root: &Path,
    seg_name: &str,
    positions: &str,
    out_dir: Option<&Path>,
    progress: impl Fn(f64, &str),
) -> Result<Vec<PositionStats>> {
    let meta = describe_dataset(root)?;
    let all: Vec<&PositionMetadata> = meta.positions().collect();
    let ids: Vec<String> = all.iter().map(|p| p.id()).collect();
    let selected = select_positions(positions, &ids)?;
    let store = zarr::open_store(root)?;

    let mut out = Vec::with_capacity(selected.len());
    for (k, &i) in selected.iter().enumerate() {
        let position = all[i];
        let stats = PositionStats {
            well: position.well.clone(),
            position: position.name.clone(),
            table: position_stats(root, &store, position, seg_name)?,
        };
        log::info!("{}: {} rows", ids[i], stats.table.len());
        if let Some(dir) = out_dir {
            stats.table.write_csv(&stats.csv_path(dir))?;
        }
        progress(
            (k + 1) as f64 / selected.len() as f64,
            &format!("Collected statistics for {}", ids[i]),
        );
        out.push(stats);
    }
    Ok(out)
}

pub fn run(args: StatsArgs, progress: impl Fn(f64, &str)) -> Result<()> {
    let out_dir = PathBuf::from(&args.output);
    let stats = extract_plate_stats(
        Path::new(&args.input),
        &args.seg_name,
        &args.positions,
        Some(&out_dir),
        &progress,
    )?;
    let rows: usize = stats.iter().map(|s| s.table.len()).sum();
    progress(
        1.0,
        &format!("Wrote {rows} rows for {} position(s) to {}", stats.len(), out_dir.display()),
    );
    Ok(())
}
