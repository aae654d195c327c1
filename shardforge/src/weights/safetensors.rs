//! `SafeTensors` file loading with memory mapping, and writing of converted
//! weights.

#![allow(clippy::doc_markdown)]

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use safetensors::tensor::SafeTensors;
use safetensors::View;

use crate::dtype::DType;
use crate::weights::{HostTensor, ParameterSource};
use crate::{Error, Result};

/// Loads weights from SafeTensors files using memory mapping
///
/// This avoids loading the entire checkpoint into RAM, instead mapping
/// the files directly and copying out one tensor at a time.
pub struct SafeTensorsLoader {
    /// Memory-mapped files (kept alive for the lifetime of the loader)
    mmaps: Vec<Mmap>,
    /// Tensor metadata: name -> (file_index, shape, dtype, data_offset, data_len)
    tensors: HashMap<String, TensorMeta>,
}

#[derive(Clone)]
struct TensorMeta {
    file_idx: usize,
    shape: Vec<usize>,
    dtype: DType,
    data_start: usize,
    data_len: usize,
}

impl SafeTensorsLoader {
    /// Load from a single SafeTensors file
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_files(&[path.as_ref().to_path_buf()])
    }

    /// Load from multiple SafeTensors files (sharded checkpoints)
    ///
    /// # Errors
    /// Returns an error if any file cannot be opened or parsed
    pub fn from_files(paths: &[PathBuf]) -> Result<Self> {
        let mut mmaps = Vec::with_capacity(paths.len());
        let mut tensors = HashMap::new();

        for (file_idx, path) in paths.iter().enumerate() {
            let file = File::open(path)?;
            // SAFETY: the checkpoint is treated as read-only for the
            // loader's lifetime.
            let mmap = unsafe { Mmap::map(&file)? };

            let st = SafeTensors::deserialize(&mmap)?;

            for (name, tensor) in st.tensors() {
                let dtype = DType::try_from(tensor.dtype())?;

                // Raw data location within the mmap
                let data = tensor.data();
                let data_start = data.as_ptr() as usize - mmap.as_ptr() as usize;

                tensors.insert(
                    name,
                    TensorMeta {
                        file_idx,
                        shape: tensor.shape().to_vec(),
                        dtype,
                        data_start,
                        data_len: data.len(),
                    },
                );
            }

            mmaps.push(mmap);
        }

        tracing::debug!(
            files = paths.len(),
            tensors = tensors.len(),
            "mapped safetensors checkpoint"
        );
        Ok(Self { mmaps, tensors })
    }

    /// Load from a directory containing SafeTensors files
    ///
    /// Finds and maps all `.safetensors` files in the directory.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be read or holds no
    /// `.safetensors` files
    pub fn from_directory(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|e| e == "safetensors"))
            .collect();

        if paths.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("No .safetensors files found in {}", dir.display()),
            )));
        }

        // Sort for deterministic loading order
        paths.sort();

        Self::from_files(&paths)
    }

    fn meta(&self, name: &str) -> Result<&TensorMeta> {
        self.tensors
            .get(name)
            .ok_or_else(|| Error::WeightNotFound(name.to_string()))
    }
}

impl ParameterSource for SafeTensorsLoader {
    fn load_native(&self, name: &str) -> Result<HostTensor> {
        let meta = self.meta(name)?;
        let mmap = &self.mmaps[meta.file_idx];
        Ok(HostTensor {
            shape: meta.shape.clone(),
            dtype: meta.dtype,
            data: mmap[meta.data_start..meta.data_start + meta.data_len].to_vec(),
        })
    }

    fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }
}

impl View for &HostTensor {
    fn dtype(&self) -> safetensors::Dtype {
        self.dtype.into()
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Write tensors to a single SafeTensors file.
///
/// # Errors
/// Returns an error if serialization or the write fails.
pub fn save_safetensors(
    path: impl AsRef<Path>,
    tensors: &BTreeMap<String, HostTensor>,
    metadata: Option<HashMap<String, String>>,
) -> Result<()> {
    let path = path.as_ref();
    safetensors::serialize_to_file(tensors.iter(), &metadata, path)?;
    tracing::debug!(path = %path.display(), tensors = tensors.len(), "wrote safetensors");
    Ok(())
}
