//! Batch assembly for variable-length utterances.
use candle::{Device, Result, Tensor};

use crate::dataset::Utterance;

/// A padded batch. All tensors share the batch dimension; `in_lengths` and
/// `out_lengths` carry the true (unpadded) sizes used for masking. The mel
/// axis is padded up to a multiple of the decoder's frames-per-step factor.
#[derive(Debug, Clone)]
pub struct Batch {
    /// [b, t_in_max, ppg_dim]
    pub ppgs: Tensor,
    /// [b, t_in_max, 2]
    pub lf0_uvs: Tensor,
    /// [b, t_out_max, mel_dim]
    pub mels: Tensor,
    /// [b] u32
    pub in_lengths: Tensor,
    /// [b] u32
    pub out_lengths: Tensor,
    /// [b] u32
    pub spk_ids: Tensor,
    /// [b, t_out_max], 1.0 at the final frame of each utterance
    pub stop_tokens: Tensor,
    /// Utterance ids, only attached by the plotting collator.
    pub fids: Option<Vec<String>>,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.ppgs.dims()[0]
    }

    pub fn to_device(&self, device: &Device) -> Result<Batch> {
        Ok(Batch {
            ppgs: self.ppgs.to_device(device)?,
            lf0_uvs: self.lf0_uvs.to_device(device)?,
            mels: self.mels.to_device(device)?,
            in_lengths: self.in_lengths.to_device(device)?,
            out_lengths: self.out_lengths.to_device(device)?,
            spk_ids: self.spk_ids.to_device(device)?,
            stop_tokens: self.stop_tokens.to_device(device)?,
            fids: self.fids.clone(),
        })
    }
}

/// Pads utterances to common lengths and derives stop-token targets.
#[derive(Debug, Clone)]
pub struct VcCollate {
    frames_per_step: usize,
    give_fids: bool,
}

impl VcCollate {
    pub fn new(frames_per_step: usize) -> Self {
        Self {
            frames_per_step,
            give_fids: false,
        }
    }

    /// Also attach utterance ids to each batch, for diagnostic plotting.
    pub fn give_fids(mut self, give_fids: bool) -> Self {
        self.give_fids = give_fids;
        self
    }

    fn round_up(&self, len: usize) -> usize {
        len.div_ceil(self.frames_per_step) * self.frames_per_step
    }

    pub fn collate(&self, items: &[Utterance]) -> Result<Batch> {
        if items.is_empty() {
            candle::bail!("cannot collate an empty batch")
        }
        let mut t_in_max = 0;
        let mut t_out_max = 0;
        for utt in items {
            t_in_max = t_in_max.max(utt.ppg.dims()[0]);
            t_out_max = t_out_max.max(self.round_up(utt.mel.dims()[0]));
        }

        let mut ppgs = Vec::with_capacity(items.len());
        let mut lf0_uvs = Vec::with_capacity(items.len());
        let mut mels = Vec::with_capacity(items.len());
        let mut in_lengths = Vec::with_capacity(items.len());
        let mut out_lengths = Vec::with_capacity(items.len());
        let mut spk_ids = Vec::with_capacity(items.len());
        let mut stops = Vec::with_capacity(items.len() * t_out_max);
        let mut fids = Vec::with_capacity(items.len());
        for utt in items {
            let t_in = utt.ppg.dims()[0];
            let t_out = utt.mel.dims()[0];
            ppgs.push(utt.ppg.pad_with_zeros(0, 0, t_in_max - t_in)?);
            lf0_uvs.push(utt.lf0_uv.pad_with_zeros(0, 0, t_in_max - t_in)?);
            mels.push(utt.mel.pad_with_zeros(0, 0, t_out_max - t_out)?);
            in_lengths.push(t_in as u32);
            out_lengths.push(t_out as u32);
            spk_ids.push(utt.spk_id);
            let stop_pos = self.round_up(t_out) - 1;
            for t in 0..t_out_max {
                stops.push(if t == stop_pos { 1f32 } else { 0f32 });
            }
            fids.push(utt.fid.clone());
        }

        let device = Device::Cpu;
        Ok(Batch {
            ppgs: Tensor::stack(&ppgs, 0)?,
            lf0_uvs: Tensor::stack(&lf0_uvs, 0)?,
            mels: Tensor::stack(&mels, 0)?,
            in_lengths: Tensor::from_vec(in_lengths, items.len(), &device)?,
            out_lengths: Tensor::from_vec(out_lengths, items.len(), &device)?,
            spk_ids: Tensor::from_vec(spk_ids, items.len(), &device)?,
            stop_tokens: Tensor::from_vec(stops, (items.len(), t_out_max), &device)?,
            fids: self.give_fids.then_some(fids),
        })
    }
}
