//! Pretrained weight sources and the key contract checked when loading them.
//!
//! The source is always passed in explicitly; there is no global table of
//! download locations.

use effnet_core::{Error, Result};
use half::{bf16, f16};
use safetensors::{tensor::TensorView, Dtype, SafeTensors};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Classifier parameters that may be left out of a load
pub const CLASSIFIER_KEYS: [&str; 2] = ["_fc.weight", "_fc.bias"];

/// One named parameter
#[derive(Debug, Clone, PartialEq)]
pub struct TensorEntry {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorEntry {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::InvalidArgument(format!(
                "shape {:?} requires {} elements but data has {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }
}

/// Parameters by name, in key order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDict {
    tensors: BTreeMap<String, TensorEntry>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, entry: TensorEntry) -> Option<TensorEntry> {
        self.tensors.insert(name.into(), entry)
    }

    pub fn remove(&mut self, name: &str) -> Option<TensorEntry> {
        self.tensors.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&TensorEntry> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorEntry)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Write all entries as F32 tensors to a safetensors file.
    pub fn write_safetensors(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let bytes: Vec<(&str, Vec<u8>, &[usize])> = self
            .tensors
            .iter()
            .map(|(name, entry)| {
                let raw = entry.data.iter().flat_map(|v| v.to_le_bytes()).collect();
                (name.as_str(), raw, entry.shape.as_slice())
            })
            .collect();

        let views = bytes
            .iter()
            .map(|(name, raw, shape)| {
                TensorView::new(Dtype::F32, shape.to_vec(), raw)
                    .map(|view| (*name, view))
                    .map_err(|e| Error::Serialization(format!("Invalid tensor '{}': {}", name, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let serialized = safetensors::serialize(views, &None)
            .map_err(|e| Error::Serialization(format!("Failed to serialize weights: {}", e)))?;
        fs::write(path, serialized)?;

        debug!("Wrote {} tensors to {:?}", self.len(), path);
        Ok(())
    }
}

/// Somewhere pretrained parameters can be read from
pub trait WeightSource {
    /// Human-readable origin, for logs and errors
    fn describe(&self) -> String;

    fn load(&self) -> Result<StateDict>;
}

impl WeightSource for StateDict {
    fn describe(&self) -> String {
        format!("in-memory state dict ({} tensors)", self.len())
    }

    fn load(&self) -> Result<StateDict> {
        Ok(self.clone())
    }
}

/// Local safetensors file
#[derive(Debug, Clone)]
pub struct SafetensorsFile {
    path: PathBuf,
}

impl SafetensorsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn decode_f32(name: &str, view: &TensorView<'_>) -> Result<Vec<f32>> {
    let raw = view.data();
    let values = match view.dtype() {
        Dtype::F32 => raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F16 => raw
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Dtype::BF16 => raw
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        other => {
            return Err(Error::Serialization(format!(
                "Unsupported dtype {:?} for tensor '{}'",
                other, name
            )))
        }
    };
    Ok(values)
}

impl WeightSource for SafetensorsFile {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn load(&self) -> Result<StateDict> {
        let bytes = fs::read(&self.path)?;
        let tensors = SafeTensors::deserialize(&bytes).map_err(|e| {
            Error::Serialization(format!("Failed to parse {}: {}", self.path.display(), e))
        })?;

        let mut state = StateDict::new();
        for (name, view) in tensors.tensors() {
            let data = decode_f32(&name, &view)?;
            state.insert(name, TensorEntry::new(view.shape().to_vec(), data)?);
        }

        debug!("Read {} tensors from {}", state.len(), self.path.display());
        Ok(state)
    }
}

/// Load parameters from `source` and check them against the model's
/// expected keys and shapes.
///
/// With `load_fc`, every expected key must be present. Without it, the
/// classifier entries are dropped from the source and only they may be
/// missing. In both cases a key the model does not have, or an entry whose
/// shape differs from the model's, is an error.
pub fn load_pretrained(
    source: &dyn WeightSource,
    expected: &BTreeMap<String, Vec<usize>>,
    load_fc: bool,
) -> Result<StateDict> {
    let mut state = source.load()?;

    if !load_fc {
        for key in CLASSIFIER_KEYS {
            state.remove(key);
        }
    }

    let missing: Vec<String> = expected
        .keys()
        .filter(|k| !state.contains(k))
        .filter(|k| load_fc || !CLASSIFIER_KEYS.contains(&k.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(Error::MissingWeightKey(missing));
    }

    let unexpected: Vec<String> = state
        .keys()
        .filter(|k| !expected.contains_key(*k))
        .map(str::to_string)
        .collect();
    if !unexpected.is_empty() {
        return Err(Error::UnexpectedWeightKey(unexpected));
    }

    let mismatched: Vec<String> = state
        .iter()
        .filter_map(|(name, entry)| {
            let shape = expected.get(name)?;
            (*shape != entry.shape).then(|| format!("{}: expected {:?}, got {:?}", name, shape, entry.shape))
        })
        .collect();
    if !mismatched.is_empty() {
        return Err(Error::WeightShapeMismatch(mismatched));
    }

    info!("Loaded pretrained weights from {}", source.describe());
    Ok(state)
}
