//! Best-effort parameter transfer from a related pre-trained model.
use std::path::Path;

use candle::{Device, Result};
use candle_nn::VarMap;

/// Parameter names carried by the pre-trained checkpoints that have no
/// counterpart in this model.
pub const DEFAULT_DENY_LIST: &[&str] = &["spk_embedding", "wav2ppg_model", "reduce_proj"];

/// What happened to each checkpoint key during a merge.
#[derive(Debug, Default)]
pub struct MergeReport {
    /// Keys whose tensors were written into the model.
    pub loaded: Vec<String>,
    /// Keys dropped by the deny-list or absent from the model.
    pub skipped: Vec<String>,
    /// Keys present in the model but with a different shape.
    pub mismatched: Vec<String>,
}

impl MergeReport {
    pub fn summary(&self) -> String {
        format!(
            "{} loaded, {} skipped, {} shape-mismatched",
            self.loaded.len(),
            self.skipped.len(),
            self.mismatched.len()
        )
    }
}

/// Merges a safetensors checkpoint into `varmap` by key, overwriting
/// matching variables. Keys containing any deny-list entry are dropped;
/// when `strip_prefix` is set, the leading name scope (up to the first `.`)
/// is removed from each checkpoint key before matching. Mismatches never
/// fail the merge; they are recorded in the returned report.
pub fn merge_pretrained<P: AsRef<Path>>(
    varmap: &VarMap,
    path: P,
    strip_prefix: bool,
    deny_list: &[&str],
    device: &Device,
) -> Result<MergeReport> {
    let tensors = candle::safetensors::load(path.as_ref(), device)?;
    let mut report = MergeReport::default();
    let vars = varmap.data().lock().unwrap();
    for (name, tensor) in tensors {
        if deny_list.iter().any(|deny| name.contains(deny)) {
            report.skipped.push(name);
            continue;
        }
        let key = if strip_prefix {
            name.split_once('.').map(|(_, rest)| rest).unwrap_or(&name)
        } else {
            name.as_str()
        };
        match vars.get(key) {
            Some(var) if var.shape() == tensor.shape() => {
                var.set(&tensor)?;
                report.loaded.push(name);
            }
            Some(_) => report.mismatched.push(name),
            None => report.skipped.push(name),
        }
    }
    Ok(report)
}
