//! Checkpoint adaptation onto the part-token parameter layout.
//!
//! Two independent adapters, both idempotent and best-effort: per-key shape
//! mismatches are recorded in the returned [`LoadReport`] and logged, never
//! fatal to the rest of the load.
//!
//! - [`PartVit::load_native`]: a flat name -> tensor dictionary (safetensors
//!   or PyTorch pickle) already in this model's naming convention, modulo an
//!   envelope prefix, classifier keys and a couple of legacy layouts.
//! - [`PartVit::load_flax`]: a Flax `.npz` archive in one of the known
//!   key-prefix conventions, requiring axis transposition, input-channel
//!   adaptation and spatial resampling before any tensor fits.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use candle_core::{Device, Tensor};
use thiserror::Error;
use tracing::{info, warn};

use crate::models::PartVit;
use crate::resample::{resize_2d, Filter};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("checkpoint not found at {0}")]
    NotFound(String),
    #[error("failed to read checkpoint: {0}")]
    Read(String),
    #[error("unknown flax checkpoint layout; keys look like {sample:?}")]
    UnknownLayout { sample: Vec<String> },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One parameter slot of the model, in manifest (name) order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

/// A checkpoint entry that could not be copied into its parameter.
/// `actual` is empty when the source array failed adaptation before its
/// shape could be compared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeMismatch {
    pub name: String,
    pub expected: Vec<usize>,
    pub actual: Vec<usize>,
}

/// Structured outcome of a best-effort checkpoint load.
#[derive(Debug, Default, Clone)]
pub struct LoadReport {
    /// Parameters overwritten in place.
    pub loaded: Vec<String>,
    /// Checkpoint keys intentionally ignored (classifier head, distillation
    /// artifacts, batch-norm step counters).
    pub skipped: Vec<String>,
    /// Entries whose array shape disagrees with the parameter manifest.
    pub mismatched: Vec<ShapeMismatch>,
    /// Checkpoint keys with no counterpart in the manifest.
    pub unknown: Vec<String>,
    /// Model parameters the checkpoint did not provide.
    pub missing: Vec<String>,
}

impl LoadReport {
    /// True when every model parameter was overwritten.
    pub fn is_complete(&self) -> bool {
        self.mismatched.is_empty() && self.missing.is_empty()
    }
}

/// Known Flax archive layouts and their key prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlaxLayout {
    /// AugReg-style archives (`opt/target/...`).
    AugReg,
    /// big_vision archives (`params/...`).
    BigVision,
    /// big_vision multimodal archives (`params/img/...`).
    BigVisionImg,
}

impl FlaxLayout {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::AugReg => "opt/target/",
            Self::BigVision => "params/",
            Self::BigVisionImg => "params/img/",
        }
    }

    /// big_vision numbers the per-block sub-modules differently.
    pub fn big_vision(self) -> bool {
        matches!(self, Self::BigVision | Self::BigVisionImg)
    }

    pub fn detect(tensors: &HashMap<String, Tensor>) -> Result<Self, LoadError> {
        if tensors.contains_key("opt/target/embedding/kernel") {
            Ok(Self::AugReg)
        } else if tensors.contains_key("params/embedding/kernel") {
            Ok(Self::BigVision)
        } else if tensors.contains_key("params/img/embedding/kernel") {
            Ok(Self::BigVisionImg)
        } else {
            let mut sample: Vec<String> = tensors.keys().take(5).cloned().collect();
            sample.sort();
            Err(LoadError::UnknownLayout { sample })
        }
    }
}

impl PartVit {
    /// Ordered manifest of every parameter slot and its expected shape.
    pub fn manifest(&self) -> Vec<ParamSpec> {
        let vars = self.varmap().data().lock().unwrap();
        let mut specs: Vec<ParamSpec> = vars
            .iter()
            .map(|(name, var)| ParamSpec {
                name: name.clone(),
                shape: var.dims().to_vec(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Load a native checkpoint (safetensors or PyTorch pickle) in place.
    pub fn load_native(&mut self, path: impl AsRef<Path>) -> Result<LoadReport, LoadError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LoadError::NotFound(path.display().to_string()));
        }
        let tensors = read_native_tensors(path, self.device())?;
        let distilled = path
            .file_name()
            .and_then(|f| f.to_str())
            .is_some_and(|f| f.contains("distilled"));
        Ok(self.apply_state_dict(&tensors, distilled))
    }

    /// Copy a native-layout state dict into the parameters, best-effort.
    pub fn apply_state_dict(
        &mut self,
        tensors: &HashMap<String, Tensor>,
        distilled: bool,
    ) -> LoadReport {
        let mut report = LoadReport::default();
        let mut keys: Vec<&String> = tensors.keys().collect();
        keys.sort();
        for key in keys {
            let name = strip_envelope(key);
            if name.contains("head")
                || name.contains("dist")
                || name.ends_with("num_batches_tracked")
            {
                report.skipped.push(name.to_string());
                continue;
            }
            let value = self.adapt_native(name, &tensors[key], distilled);
            self.assign(&mut report, name, value);
        }
        self.finish_report(report, "native")
    }

    /// Legacy-layout fixes applied before the shape check.
    fn adapt_native(
        &self,
        name: &str,
        value: &Tensor,
        distilled: bool,
    ) -> candle_core::Result<Tensor> {
        if name == "patch_embed.proj.weight" && value.rank() < 4 {
            // 2-D projection weights predate the conv patchification.
            if let Some(target) = self.param(name) {
                let (o, i, kh, kw) = target.dims4()?;
                return value.reshape((o, i, kh, kw));
            }
        }
        if name == "pos_embed" && distilled {
            // Distilled checkpoints store (cls, dist, patches...); drop the
            // distillation slot so the grid lines up.
            let expected = self.param(name).map(|t| t.dims().to_vec());
            if expected.as_deref() != Some(value.dims()) {
                let n = value.dim(1)?;
                let cls = value.narrow(1, 0, 1)?;
                let rest = value.narrow(1, 2, n - 2)?;
                return Tensor::cat(&[&cls, &rest], 1);
            }
        }
        Ok(value.clone())
    }

    /// Load a Flax `.npz` archive in place. With `prefix` unset, the layout
    /// is detected from the key set; an unknown layout is rejected.
    pub fn load_flax(
        &mut self,
        path: impl AsRef<Path>,
        prefix: Option<&str>,
    ) -> Result<LoadReport, LoadError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LoadError::NotFound(path.display().to_string()));
        }
        let npz =
            candle_core::npy::NpzTensors::new(path).map_err(|e| LoadError::Read(e.to_string()))?;
        let names: Vec<String> = npz.names().iter().map(|n| n.to_string()).collect();
        let mut tensors = HashMap::new();
        for name in names {
            if let Some(t) = npz.get(&name).map_err(|e| LoadError::Read(e.to_string()))? {
                tensors.insert(name, t);
            }
        }
        self.apply_flax(&tensors, prefix)
    }

    /// Adapt and copy a Flax tensor dictionary into the parameters.
    pub fn apply_flax(
        &mut self,
        tensors: &HashMap<String, Tensor>,
        prefix: Option<&str>,
    ) -> Result<LoadReport, LoadError> {
        // An explicit prefix implies the standard sub-module numbering.
        let (prefix, big_vision) = match prefix {
            Some(p) => (p.to_string(), false),
            None => {
                let layout = FlaxLayout::detect(tensors)?;
                (layout.prefix().to_string(), layout.big_vision())
            }
        };
        let key = |suffix: &str| format!("{prefix}{suffix}");
        let d = self.config().embed_dim;
        let mut report = LoadReport::default();

        if let Some(w) = tensors.get(&key("embedding/kernel")) {
            let adapted = self.adapt_patch_proj(w);
            self.assign(&mut report, "patch_embed.proj.weight", adapted);
        }
        if let Some(b) = tensors.get(&key("embedding/bias")) {
            self.assign(&mut report, "patch_embed.proj.bias", n2p(b, true));
        }
        if let Some(t) = tensors.get(&key("cls")) {
            self.assign(&mut report, "cls_token", n2p(t, false));
        }

        let pos_key = if big_vision {
            key("pos_embedding")
        } else {
            key("Transformer/posembed_input/pos_embedding")
        };
        if let Some(p) = tensors.get(&pos_key) {
            let num_prefix_tokens = if big_vision { 0 } else { 1 };
            let adapted =
                n2p(p, false).and_then(|p| self.adapt_flax_pos_embed(&p, num_prefix_tokens));
            self.assign(&mut report, "pos_embed", adapted);
        }

        if let Some(t) = tensors.get(&key("Transformer/encoder_norm/scale")) {
            self.assign(&mut report, "norm.weight", n2p(t, true));
        }
        if let Some(t) = tensors.get(&key("Transformer/encoder_norm/bias")) {
            self.assign(&mut report, "norm.bias", n2p(t, true));
        }

        let (mha_sub, mlp_sub, ln2_sub) = if big_vision { (0, 0, 1) } else { (1, 3, 2) };
        for i in 0..self.config().depth {
            let bp = key(&format!("Transformer/encoderblock_{i}/"));
            let mp = format!("{bp}MultiHeadDotProductAttention_{mha_sub}/");
            let dst = format!("blocks.{i}");

            if let Some(t) = tensors.get(&format!("{bp}LayerNorm_0/scale")) {
                self.assign(&mut report, &format!("{dst}.norm1.weight"), n2p(t, true));
            }
            if let Some(t) = tensors.get(&format!("{bp}LayerNorm_0/bias")) {
                self.assign(&mut report, &format!("{dst}.norm1.bias"), n2p(t, true));
            }
            if let (Some(q), Some(k), Some(v)) = (
                tensors.get(&format!("{mp}query/kernel")),
                tensors.get(&format!("{mp}key/kernel")),
                tensors.get(&format!("{mp}value/kernel")),
            ) {
                self.assign(
                    &mut report,
                    &format!("{dst}.attn.qkv.weight"),
                    flax_qkv_weight(q, k, v),
                );
            }
            if let (Some(q), Some(k), Some(v)) = (
                tensors.get(&format!("{mp}query/bias")),
                tensors.get(&format!("{mp}key/bias")),
                tensors.get(&format!("{mp}value/bias")),
            ) {
                self.assign(
                    &mut report,
                    &format!("{dst}.attn.qkv.bias"),
                    flax_qkv_bias(q, k, v),
                );
            }
            if let Some(t) = tensors.get(&format!("{mp}out/kernel")) {
                let adapted = n2p(t, true).and_then(|t| t.reshape((d, d)));
                self.assign(&mut report, &format!("{dst}.attn.proj.weight"), adapted);
            }
            if let Some(t) = tensors.get(&format!("{mp}out/bias")) {
                self.assign(&mut report, &format!("{dst}.attn.proj.bias"), n2p(t, true));
            }
            if let Some(t) = tensors.get(&format!("{bp}LayerNorm_{ln2_sub}/scale")) {
                self.assign(&mut report, &format!("{dst}.norm2.weight"), n2p(t, true));
            }
            if let Some(t) = tensors.get(&format!("{bp}LayerNorm_{ln2_sub}/bias")) {
                self.assign(&mut report, &format!("{dst}.norm2.bias"), n2p(t, true));
            }
            for (fc, dense) in [("fc1", 0), ("fc2", 1)] {
                let base = format!("{bp}MlpBlock_{mlp_sub}/Dense_{dense}/");
                if let Some(t) = tensors.get(&format!("{base}kernel")) {
                    self.assign(&mut report, &format!("{dst}.mlp.{fc}.weight"), n2p(t, true));
                }
                if let Some(t) = tensors.get(&format!("{base}bias")) {
                    self.assign(&mut report, &format!("{dst}.mlp.{fc}.bias"), n2p(t, true));
                }
            }
        }

        Ok(self.finish_report(report, "flax"))
    }

    /// Flax patch kernel -> this model's projection conv: transpose HWIO ->
    /// OIHW, adapt the input channel count, resample the spatial grid.
    fn adapt_patch_proj(&self, w: &Tensor) -> candle_core::Result<Tensor> {
        let Some(target) = self.param("patch_embed.proj.weight") else {
            candle_core::bail!("model has no patch projection weight");
        };
        let (_to, ti, th, tw) = target.dims4()?;
        let w = n2p(w, true)?;
        let w = adapt_input_conv(ti, &w)?;
        let (o, i, kh, kw) = w.dims4()?;
        if (kh, kw) == (th, tw) {
            return Ok(w);
        }
        let resampled = resize_2d(&w.reshape((o * i, kh, kw))?, th, tw, Filter::Bilinear)?;
        resampled.reshape((o, i, th, tw))
    }

    /// Flax absolute positional embedding -> the model's patch grid. Prefix
    /// (class) positions are dropped; the grid is resampled to the model's
    /// actual `gridH x gridW` rather than any fixed position cap.
    fn adapt_flax_pos_embed(
        &self,
        pos: &Tensor,
        num_prefix_tokens: usize,
    ) -> candle_core::Result<Tensor> {
        let (_one, total, d) = pos.dims3()?;
        let (gh, gw) = self.config().grid();
        let grid = pos.narrow(1, num_prefix_tokens, total - num_prefix_tokens)?;
        let src = total - num_prefix_tokens;
        if src == gh * gw {
            return grid.contiguous();
        }
        let side = (src as f64).sqrt() as usize;
        if side * side != src {
            candle_core::bail!("foreign positional grid of {src} positions is not square");
        }
        let grid = grid
            .reshape((side, side, d))?
            .permute((2, 0, 1))?
            .contiguous()?;
        let grid = resize_2d(&grid, gh, gw, Filter::Bilinear)?;
        grid.permute((1, 2, 0))?
            .contiguous()?
            .reshape((1, gh * gw, d))
    }

    /// Copy an adapted tensor into its parameter slot, recording the outcome.
    fn assign(&self, report: &mut LoadReport, name: &str, value: candle_core::Result<Tensor>) {
        let value = match value {
            Ok(v) => v,
            Err(e) => {
                warn!(param = name, error = %e, "failed to adapt checkpoint tensor");
                let expected = self
                    .param(name)
                    .map(|t| t.dims().to_vec())
                    .unwrap_or_default();
                report.mismatched.push(ShapeMismatch {
                    name: name.to_string(),
                    expected,
                    actual: Vec::new(),
                });
                return;
            }
        };
        let vars = self.varmap().data().lock().unwrap();
        let Some(var) = vars.get(name) else {
            report.unknown.push(name.to_string());
            return;
        };
        if var.dims() != value.dims() {
            warn!(
                param = name,
                expected = ?var.dims(),
                actual = ?value.dims(),
                "checkpoint shape mismatch"
            );
            report.mismatched.push(ShapeMismatch {
                name: name.to_string(),
                expected: var.dims().to_vec(),
                actual: value.dims().to_vec(),
            });
            return;
        }
        let copied = value
            .to_device(var.device())
            .and_then(|v| v.to_dtype(var.dtype()))
            .and_then(|v| var.set(&v));
        match copied {
            Ok(()) => report.loaded.push(name.to_string()),
            Err(e) => {
                warn!(param = name, error = %e, "failed to copy checkpoint tensor");
                report.mismatched.push(ShapeMismatch {
                    name: name.to_string(),
                    expected: var.dims().to_vec(),
                    actual: value.dims().to_vec(),
                });
            }
        }
    }

    fn finish_report(&self, mut report: LoadReport, format: &str) -> LoadReport {
        let touched: HashSet<&str> = report
            .loaded
            .iter()
            .map(String::as_str)
            .chain(report.mismatched.iter().map(|m| m.name.as_str()))
            .collect();
        let manifest = self.manifest();
        report.missing = manifest
            .iter()
            .filter(|spec| !touched.contains(spec.name.as_str()))
            .map(|spec| spec.name.clone())
            .collect();
        info!(
            format,
            loaded = report.loaded.len(),
            total = manifest.len(),
            skipped = report.skipped.len(),
            mismatched = report.mismatched.len(),
            unknown = report.unknown.len(),
            "loaded checkpoint parameters"
        );
        report
    }
}

fn read_native_tensors(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>, LoadError> {
    let is_safetensors = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("safetensors"));
    if is_safetensors {
        candle_core::safetensors::load(path, device).map_err(|e| LoadError::Read(e.to_string()))
    } else {
        let pairs =
            candle_core::pickle::read_all(path).map_err(|e| LoadError::Read(e.to_string()))?;
        Ok(pairs.into_iter().collect())
    }
}

/// Peel the serialization envelope some training frameworks wrap around the
/// state dict.
fn strip_envelope(key: &str) -> &str {
    key.strip_prefix("model.")
        .or_else(|| key.strip_prefix("state_dict."))
        .or_else(|| key.strip_prefix("module."))
        .unwrap_or(key)
}

/// Flax array -> native layout: HWIO conv kernels to OIHW, matrices
/// transposed, 1x1x1-leading scales flattened. `transpose = false` keeps the
/// stored layout (tokens, positional grids).
fn n2p(t: &Tensor, transpose: bool) -> candle_core::Result<Tensor> {
    let dims = t.dims().to_vec();
    if dims.len() == 4 && dims[0] == 1 && dims[1] == 1 && dims[2] == 1 {
        return t.flatten_all();
    }
    if !transpose {
        return Ok(t.clone());
    }
    match dims.len() {
        4 => t.permute((3, 2, 0, 1))?.contiguous(),
        3 => t.permute((2, 0, 1))?.contiguous(),
        2 => t.t()?.contiguous(),
        _ => Ok(t.clone()),
    }
}

/// Assemble the fused qkv weight `[3D, D]` from per-projection Flax kernels
/// of shape `[D, heads, head_dim]`.
fn flax_qkv_weight(q: &Tensor, k: &Tensor, v: &Tensor) -> candle_core::Result<Tensor> {
    let rows = |t: &Tensor| -> candle_core::Result<Tensor> {
        let (d, h, hd) = t.dims3()?;
        t.reshape((d, h * hd))?.t()?.contiguous()
    };
    Tensor::cat(&[&rows(q)?, &rows(k)?, &rows(v)?], 0)
}

/// Fused qkv bias `[3D]` from per-projection `[heads, head_dim]` biases.
fn flax_qkv_bias(q: &Tensor, k: &Tensor, v: &Tensor) -> candle_core::Result<Tensor> {
    Tensor::cat(&[&q.flatten_all()?, &k.flatten_all()?, &v.flatten_all()?], 0)
}

/// Adapt a conv kernel's input-channel count: sum to grayscale, or tile and
/// rescale RGB weights up to a wider stem.
fn adapt_input_conv(in_chans: usize, w: &Tensor) -> candle_core::Result<Tensor> {
    let (_o, i, _kh, _kw) = w.dims4()?;
    if i == in_chans {
        return Ok(w.clone());
    }
    if in_chans == 1 {
        return w.sum_keepdim(1);
    }
    if i != 3 {
        candle_core::bail!("cannot adapt patch projection from {i} input channels to {in_chans}");
    }
    let reps = in_chans.div_ceil(3);
    let tiled = Tensor::cat(&vec![w; reps], 1)?.narrow(1, 0, in_chans)?;
    tiled * (3.0 / in_chans as f64)
}
