//! OME-Zarr plate introspection.
//!
//! Reads the `zarr.json` documents of a Zarr v3 plate directly and returns a
//! structured description: wells -> positions -> {axes, channels, scale
//! levels, voxel spacing}. NGFF 0.5 keeps its attributes under an `ome` key;
//! 0.4-style attributes placed at the top level of a v3 store are accepted
//! too. Zarr v2 stores are rejected.

use clap::Args;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::metric::VoxelSpacing;

#[derive(Args, Clone)]
pub struct DescribeArgs {
    /// Path to the OME-Zarr plate
    #[arg(long)]
    pub input: String,
    /// Print JSON instead of the tree view
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetMetadata {
    pub path: PathBuf,
    pub version: Option<String>,
    pub wells: Vec<WellMetadata>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WellMetadata {
    pub name: String,
    pub positions: Vec<PositionMetadata>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionMetadata {
    pub well: String,
    pub name: String,
    /// Group path relative to the plate root, e.g. `A/1/0`.
    pub path: String,
    pub axes: Vec<AxisMetadata>,
    pub channels: Vec<String>,
    pub layout: ScaleLayout,
    pub voxel_spacing: Option<VoxelSpacing>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisMetadata {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Level {
    /// Array path relative to the position group.
    pub path: String,
    pub shape: Vec<u64>,
    pub chunks: Vec<u64>,
    pub dtype: String,
    /// `scale` transform of this level, one entry per axis.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub scale: Vec<f64>,
}

impl Level {
    /// Physical voxel size from the last three scale entries.
    pub fn voxel_spacing(&self) -> Option<VoxelSpacing> {
        let n = self.scale.len();
        (n >= 3).then(|| VoxelSpacing::new(self.scale[n - 3], self.scale[n - 2], self.scale[n - 1]))
    }
}

/// Resolution pyramid of a position, decided once when metadata is read.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "levels", rename_all = "snake_case")]
pub enum ScaleLayout {
    SingleScale(Level),
    Multiscale(Vec<Level>),
}

impl ScaleLayout {
    fn from_levels(mut levels: Vec<Level>) -> Option<Self> {
        match levels.len() {
            0 => None,
            1 => levels.pop().map(ScaleLayout::SingleScale),
            _ => Some(ScaleLayout::Multiscale(levels)),
        }
    }

    /// Full-resolution level.
    pub fn base(&self) -> &Level {
        match self {
            ScaleLayout::SingleScale(level) => level,
            ScaleLayout::Multiscale(levels) => &levels[0],
        }
    }

    pub fn levels(&self) -> &[Level] {
        match self {
            ScaleLayout::SingleScale(level) => std::slice::from_ref(level),
            ScaleLayout::Multiscale(levels) => levels,
        }
    }

    pub fn is_multiscale(&self) -> bool {
        matches!(self, ScaleLayout::Multiscale(_))
    }
}

impl PositionMetadata {
    /// `well/position`, unique within a plate.
    pub fn id(&self) -> String {
        format!("{}/{}", self.well, self.name)
    }

    /// Base-level `(t, c, z, y, x)` sizes. Fails unless the axes are exactly
    /// t, c, z, y, x in that order.
    pub fn tczyx(&self) -> Result<[usize; 5]> {
        let names: Vec<&str> = self.axes.iter().map(|a| a.name.as_str()).collect();
        let shape = &self.layout.base().shape;
        if names != ["t", "c", "z", "y", "x"] || shape.len() != 5 {
            return Err(Error::Config(format!(
                "position {} must have axes t, c, z, y, x (found {:?}, shape {:?})",
                self.id(),
                names,
                shape
            )));
        }
        Ok([
            shape[0] as usize,
            shape[1] as usize,
            shape[2] as usize,
            shape[3] as usize,
            shape[4] as usize,
        ])
    }

    /// Resolution level `index`, 0 being the base.
    pub fn level(&self, index: usize) -> Result<&Level> {
        let levels = self.layout.levels();
        levels.get(index).ok_or_else(|| {
            Error::Config(format!(
                "position {} has no level {index} ({} level(s))",
                self.id(),
                levels.len()
            ))
        })
    }

    /// `(t, c, z, y, x)` sizes of level `index`.
    pub fn level_tczyx(&self, index: usize) -> Result<[usize; 5]> {
        self.tczyx()?;
        let shape = &self.level(index)?.shape;
        match shape[..] {
            [t, c, z, y, x] => Ok([t, c, z, y, x].map(|d| d as usize)),
            _ => Err(Error::metadata(
                format!("{}/{}", self.path, self.level(index)?.path),
                format!("expected 5 dimensions, found {shape:?}"),
            )),
        }
    }

    /// Channel names, falling back to indices when the metadata has none.
    pub fn channel_names(&self) -> Vec<String> {
        if !self.channels.is_empty() {
            return self.channels.clone();
        }
        let n = self.layout.base().shape.get(1).copied().unwrap_or(0);
        (0..n).map(|c| c.to_string()).collect()
    }
}

impl DatasetMetadata {
    /// All positions in plate order.
    pub fn positions(&self) -> impl Iterator<Item = &PositionMetadata> {
        self.wells.iter().flat_map(|w| w.positions.iter())
    }
}

// ---------------------------------------------------------------------------
// zarr.json documents
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct NodeDocument {
    zarr_format: u8,
    node_type: String,
    #[serde(default)]
    attributes: Map<String, Value>,
    #[serde(default)]
    shape: Vec<u64>,
    #[serde(default)]
    data_type: Option<Value>,
    #[serde(default)]
    chunk_grid: Option<ChunkGrid>,
}

#[derive(Deserialize)]
struct ChunkGrid {
    configuration: ChunkGridConfiguration,
}

#[derive(Deserialize)]
struct ChunkGridConfiguration {
    chunk_shape: Vec<u64>,
}

#[derive(Deserialize)]
struct PathEntry {
    path: String,
}

#[derive(Deserialize)]
struct Multiscale {
    #[serde(default)]
    axes: Vec<AxisMetadata>,
    datasets: Vec<MultiscaleDataset>,
}

#[derive(Deserialize)]
struct MultiscaleDataset {
    path: String,
    #[serde(default, rename = "coordinateTransformations")]
    transformations: Vec<Transformation>,
}

#[derive(Deserialize)]
struct Transformation {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    scale: Vec<f64>,
}

#[derive(Deserialize)]
struct OmeroChannel {
    #[serde(default)]
    label: Option<String>,
}

fn read_node(root: &Path, rel: &str) -> Result<NodeDocument> {
    let dir = if rel.is_empty() { root.to_path_buf() } else { root.join(rel) };
    let doc = dir.join("zarr.json");
    if !doc.exists() {
        if dir.join(".zgroup").exists() || dir.join(".zarray").exists() {
            return Err(Error::Config(format!(
                "{} is Zarr v2; only Zarr v3 stores are supported",
                dir.display()
            )));
        }
        return Err(Error::metadata(doc.display().to_string(), "missing zarr.json"));
    }
    let node: NodeDocument = serde_json::from_str(&fs::read_to_string(&doc)?)
        .map_err(|e| Error::metadata(doc.display().to_string(), e.to_string()))?;
    if node.zarr_format != 3 {
        return Err(Error::metadata(
            doc.display().to_string(),
            format!("unsupported zarr_format {}", node.zarr_format),
        ));
    }
    Ok(node)
}

/// The NGFF attribute block: `attributes.ome` when present, else `attributes`.
fn ome(attributes: &Map<String, Value>) -> &Map<String, Value> {
    attributes
        .get("ome")
        .and_then(Value::as_object)
        .unwrap_or(attributes)
}

fn field<T: serde::de::DeserializeOwned>(
    attrs: &Map<String, Value>,
    pointer: &str,
    at: &str,
) -> Result<T> {
    let value = Value::Object(attrs.clone());
    let found = value
        .pointer(pointer)
        .ok_or_else(|| Error::metadata(at, format!("missing {pointer}")))?;
    serde_json::from_value(found.clone())
        .map_err(|e| Error::metadata(at, format!("{pointer}: {e}")))
}

/// Describe the plate at `path`.
pub fn describe_dataset(path: &Path) -> Result<DatasetMetadata> {
    if !path.exists() {
        return Err(Error::Config(format!("dataset path {} does not exist", path.display())));
    }
    let root = read_node(path, "")?;
    let root_attrs = ome(&root.attributes);
    if root_attrs.get("plate").is_none() {
        return Err(Error::Config(format!(
            "{} is not an OME-Zarr plate (no plate metadata)",
            path.display()
        )));
    }
    let version = root_attrs
        .get("version")
        .or_else(|| root_attrs.get("plate").and_then(|p| p.get("version")))
        .and_then(Value::as_str)
        .map(String::from);
    let well_entries: Vec<PathEntry> = field(root_attrs, "/plate/wells", "plate")?;

    let mut wells = Vec::with_capacity(well_entries.len());
    for well_entry in well_entries {
        let well_node = read_node(path, &well_entry.path)?;
        let images: Vec<PathEntry> =
            field(ome(&well_node.attributes), "/well/images", &well_entry.path)?;
        let mut positions = Vec::with_capacity(images.len());
        for image in images {
            let rel = format!("{}/{}", well_entry.path, image.path);
            positions.push(describe_position(path, &well_entry.path, &image.path, &rel)?);
        }
        wells.push(WellMetadata {
            name: well_entry.path,
            positions,
        });
    }
    Ok(DatasetMetadata {
        path: path.to_path_buf(),
        version,
        wells,
    })
}

fn describe_position(root: &Path, well: &str, name: &str, rel: &str) -> Result<PositionMetadata> {
    let node = read_node(root, rel)?;
    if node.node_type != "group" {
        return Err(Error::metadata(rel, "position is not a group"));
    }
    let attrs = ome(&node.attributes);
    let multiscales: Vec<Multiscale> = field(attrs, "/multiscales", rel)?;
    let multiscale = multiscales
        .into_iter()
        .next()
        .ok_or_else(|| Error::metadata(rel, "empty multiscales"))?;

    let channels = match attrs.get("omero").and_then(|o| o.get("channels")) {
        Some(v) => serde_json::from_value::<Vec<OmeroChannel>>(v.clone())
            .map_err(|e| Error::metadata(rel, format!("omero channels: {e}")))?
            .into_iter()
            .enumerate()
            .map(|(i, c)| c.label.unwrap_or_else(|| i.to_string()))
            .collect(),
        None => Vec::new(),
    };

    let levels = multiscale
        .datasets
        .iter()
        .map(|d| {
            let mut level = read_level(root, rel, &d.path)?;
            if let Some(t) = d.transformations.iter().find(|t| t.kind == "scale") {
                level.scale = t.scale.clone();
            }
            Ok(level)
        })
        .collect::<Result<Vec<_>>>()?;
    let voxel_spacing = levels.first().and_then(Level::voxel_spacing);
    let layout = ScaleLayout::from_levels(levels)
        .ok_or_else(|| Error::metadata(rel, "multiscales has no datasets"))?;

    Ok(PositionMetadata {
        well: well.to_string(),
        name: name.to_string(),
        path: rel.to_string(),
        axes: multiscale.axes,
        channels,
        layout,
        voxel_spacing,
    })
}

/// Shape, chunking and dtype of the array `name` inside the group `group`.
pub fn read_level(root: &Path, group: &str, name: &str) -> Result<Level> {
    let rel = format!("{group}/{name}");
    let array = read_node(root, &rel)?;
    if array.node_type != "array" {
        return Err(Error::metadata(rel, "expected an array"));
    }
    let dtype = match &array.data_type {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => return Err(Error::metadata(rel, "missing data_type")),
    };
    let chunks = array
        .chunk_grid
        .map(|g| g.configuration.chunk_shape)
        .unwrap_or_else(|| array.shape.clone());
    Ok(Level {
        path: name.to_string(),
        shape: array.shape,
        chunks,
        dtype,
        scale: Vec::new(),
    })
}

/// Keep the base entry of the position's `multiscales[0].datasets` and put
/// `levels` after it.
pub fn replace_downsampled_levels(root: &Path, rel: &str, levels: Vec<Value>) -> Result<()> {
    let doc_path = root.join(rel).join("zarr.json");
    let mut doc: Value = serde_json::from_str(&fs::read_to_string(&doc_path)?)?;
    let nested = doc.pointer("/attributes/ome").is_some_and(Value::is_object);
    let pointer = if nested {
        "/attributes/ome/multiscales/0/datasets"
    } else {
        "/attributes/multiscales/0/datasets"
    };
    let datasets = doc
        .pointer_mut(pointer)
        .and_then(Value::as_array_mut)
        .ok_or_else(|| Error::metadata(rel, format!("missing {pointer}")))?;
    datasets.truncate(1);
    datasets.extend(levels);
    fs::write(&doc_path, serde_json::to_string_pretty(&doc)?)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Terminal output
// ---------------------------------------------------------------------------

fn format_axes(axes: &[AxisMetadata]) -> String {
    if axes.is_empty() {
        return "N/A".to_string();
    }
    axes.iter()
        .map(|a| match (&a.kind, &a.unit) {
            (Some(kind), Some(unit)) => format!("{} ({kind}, {unit})", a.name),
            (Some(kind), None) => format!("{} ({kind})", a.name),
            _ => a.name.clone(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_dims(v: &[u64]) -> String {
    let parts: Vec<String> = v.iter().map(u64::to_string).collect();
    format!("({})", parts.join(", "))
}

/// Human-readable tree of the plate.
pub fn format_pretty(meta: &DatasetMetadata) -> String {
    let mut lines = vec![
        format!("Dataset: {}", meta.path.display()),
        format!("OME-NGFF version: {}", meta.version.as_deref().unwrap_or("N/A")),
        String::new(),
    ];
    for well in &meta.wells {
        lines.push(format!("Well: {}", well.name));
        for pos in &well.positions {
            lines.push(format!("  ├── Position: {}", pos.name));
            lines.push(format!(
                "  │   • Multiscale  : {}",
                if pos.layout.is_multiscale() { "Yes" } else { "No" }
            ));
            for (i, level) in pos.layout.levels().iter().enumerate() {
                lines.push(format!("  │     Level {i} ({})", level.path));
                lines.push(format!("  │        • Shape  : {}", format_dims(&level.shape)));
                lines.push(format!("  │        • Chunks : {}", format_dims(&level.chunks)));
                lines.push(format!("  │        • Dtype  : {}", level.dtype));
            }
            lines.push(format!("  │   • Channels    : {:?}", pos.channel_names()));
            lines.push(format!("  │   • Axes        : {}", format_axes(&pos.axes)));
            if let Some(s) = pos.voxel_spacing {
                lines.push(format!("  │   • Voxel size  : z={} y={} x={}", s.z, s.y, s.x));
            }
            lines.push(format!("  │   • Path        : {}", pos.path));
        }
    }
    lines.join("\n")
}

pub fn run(args: DescribeArgs) -> Result<()> {
    let meta = describe_dataset(Path::new(&args.input))?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&meta)?);
    } else {
        println!("{}", format_pretty(&meta));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Minimal on-disk plate documents for tests.

    use serde_json::{json, Value};
    use std::fs;
    use std::path::Path;

    pub fn write_doc(root: &Path, rel: &str, doc: Value) {
        let dir = if rel.is_empty() { root.to_path_buf() } else { root.join(rel) };
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("zarr.json"), serde_json::to_string_pretty(&doc).unwrap()).unwrap();
    }

    pub fn group(attributes: Value) -> Value {
        json!({"zarr_format": 3, "node_type": "group", "attributes": attributes})
    }

    pub fn array_doc(shape: &[u64], chunks: &[u64], dtype: &str) -> Value {
        json!({
            "zarr_format": 3,
            "node_type": "array",
            "shape": shape,
            "data_type": dtype,
            "chunk_grid": {"name": "regular", "configuration": {"chunk_shape": chunks}},
            "chunk_key_encoding": {"name": "default"},
            "fill_value": 0,
            "codecs": [{"name": "bytes", "configuration": {"endian": "little"}}]
        })
    }
}
