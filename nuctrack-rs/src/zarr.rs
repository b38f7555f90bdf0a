use ndarray::Array3;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use zarrs::array::{data_type, Array, ArrayBuilder, ArraySubset};
use zarrs::config::MetadataRetrieveVersion;
use zarrs::filesystem::FilesystemStore;
use zarrs::storage::ReadableWritableListableStorageTraits;

use crate::error::{Error, Result};
use crate::volume::LabelVolume;

pub type Store = Arc<FilesystemStore>;

/// Type alias for arrays in the store.
pub type StoreArray = Array<dyn ReadableWritableListableStorageTraits>;

pub fn open_store(root: &Path) -> Result<Store> {
    let store = FilesystemStore::new(root).map_err(Error::zarr)?;
    Ok(Arc::new(store))
}

/// Open a Zarr v3 array. Rejects v2 data.
pub fn open_array(store: &Store, path: &str) -> Result<StoreArray> {
    let store_trait: Arc<dyn ReadableWritableListableStorageTraits> = store.clone();
    Array::open_opt(store_trait, path, &MetadataRetrieveVersion::V3)
        .map_err(|e| Error::Zarr(format!("{path}: {e}")))
}

pub fn create_array_u16(
    store: &Store,
    path: &str,
    shape: Vec<u64>,
    chunks: Vec<u64>,
    attrs: Option<serde_json::Map<String, serde_json::Value>>,
) -> Result<StoreArray> {
    let store_trait: Arc<dyn ReadableWritableListableStorageTraits> = store.clone();
    let mut builder = ArrayBuilder::new(shape, chunks, data_type::uint16(), 0u16);
    if let Some(a) = attrs {
        builder.attributes(a);
    }
    let array = builder.build(store_trait, path).map_err(Error::zarr)?;
    array.store_metadata().map_err(Error::zarr)?;
    Ok(array)
}

pub fn create_array_u32(
    store: &Store,
    path: &str,
    shape: Vec<u64>,
    chunks: Vec<u64>,
    attrs: Option<serde_json::Map<String, serde_json::Value>>,
) -> Result<StoreArray> {
    let store_trait: Arc<dyn ReadableWritableListableStorageTraits> = store.clone();
    let mut builder = ArrayBuilder::new(shape, chunks, data_type::uint32(), 0u32);
    if let Some(a) = attrs {
        builder.attributes(a);
    }
    let array = builder.build(store_trait, path).map_err(Error::zarr)?;
    array.store_metadata().map_err(Error::zarr)?;
    Ok(array)
}

pub fn create_array_f32(
    store: &Store,
    path: &str,
    shape: Vec<u64>,
    chunks: Vec<u64>,
    attrs: Option<serde_json::Map<String, serde_json::Value>>,
) -> Result<StoreArray> {
    let store_trait: Arc<dyn ReadableWritableListableStorageTraits> = store.clone();
    let mut builder = ArrayBuilder::new(shape, chunks, data_type::float32(), 0f32);
    if let Some(a) = attrs {
        builder.attributes(a);
    }
    let array = builder.build(store_trait, path).map_err(Error::zarr)?;
    array.store_metadata().map_err(Error::zarr)?;
    Ok(array)
}

pub fn store_chunk_u16(array: &StoreArray, chunk_indices: &[u64], data: &[u16]) -> Result<()> {
    array.store_chunk(chunk_indices, data).map_err(Error::zarr)
}

pub fn store_chunk_u32(array: &StoreArray, chunk_indices: &[u64], data: &[u32]) -> Result<()> {
    array.store_chunk(chunk_indices, data).map_err(Error::zarr)
}

pub fn store_chunk_f32(array: &StoreArray, chunk_indices: &[u64], data: &[f32]) -> Result<()> {
    array.store_chunk(chunk_indices, data).map_err(Error::zarr)
}

/// Element types of image arrays we can read as intensities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageDtype {
    U8,
    U16,
    U32,
    F32,
    F64,
}

impl ImageDtype {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "uint8" => Ok(ImageDtype::U8),
            "uint16" => Ok(ImageDtype::U16),
            "uint32" => Ok(ImageDtype::U32),
            "float32" => Ok(ImageDtype::F32),
            "float64" => Ok(ImageDtype::F64),
            other => Err(Error::Config(format!("unsupported image data type {other:?}"))),
        }
    }
}

fn subset(ranges: &[Range<u64>]) -> ArraySubset {
    ArraySubset::new_with_ranges(ranges)
}

/// Read a `(z, y, x)` block of a 5D `(t, c, z, y, x)` array as f32.
pub fn read_volume_f32(
    array: &StoreArray,
    dtype: ImageDtype,
    t: u64,
    c: u64,
    zyx: (usize, usize, usize),
) -> Result<Array3<f32>> {
    let (z, y, x) = zyx;
    let s = subset(&[t..t + 1, c..c + 1, 0..z as u64, 0..y as u64, 0..x as u64]);
    let data: Vec<f32> = match dtype {
        ImageDtype::U8 => array
            .retrieve_array_subset::<Vec<u8>>(&s)
            .map_err(Error::zarr)?
            .into_iter()
            .map(f32::from)
            .collect(),
        ImageDtype::U16 => array
            .retrieve_array_subset::<Vec<u16>>(&s)
            .map_err(Error::zarr)?
            .into_iter()
            .map(f32::from)
            .collect(),
        ImageDtype::U32 => array
            .retrieve_array_subset::<Vec<u32>>(&s)
            .map_err(Error::zarr)?
            .into_iter()
            .map(|v| v as f32)
            .collect(),
        ImageDtype::F32 => array
            .retrieve_array_subset::<Vec<f32>>(&s)
            .map_err(Error::zarr)?,
        ImageDtype::F64 => array
            .retrieve_array_subset::<Vec<f64>>(&s)
            .map_err(Error::zarr)?
            .into_iter()
            .map(|v| v as f32)
            .collect(),
    };
    Ok(Array3::from_shape_vec((z, y, x), data)?)
}

/// Read frame `t` of a `(t, 1, z, y, x)` label array.
pub fn read_labels(
    array: &StoreArray,
    dtype: ImageDtype,
    t: u64,
    zyx: (usize, usize, usize),
) -> Result<LabelVolume> {
    let (z, y, x) = zyx;
    let s = subset(&[t..t + 1, 0..1, 0..z as u64, 0..y as u64, 0..x as u64]);
    let data: Vec<u32> = match dtype {
        ImageDtype::U8 => array
            .retrieve_array_subset::<Vec<u8>>(&s)
            .map_err(Error::zarr)?
            .into_iter()
            .map(u32::from)
            .collect(),
        ImageDtype::U16 => array
            .retrieve_array_subset::<Vec<u16>>(&s)
            .map_err(Error::zarr)?
            .into_iter()
            .map(u32::from)
            .collect(),
        ImageDtype::U32 => array
            .retrieve_array_subset::<Vec<u32>>(&s)
            .map_err(Error::zarr)?,
        other => {
            return Err(Error::Config(format!(
                "label arrays must be unsigned integers, found {other:?}"
            )))
        }
    };
    Ok(Array3::from_shape_vec((z, y, x), data)?)
}
