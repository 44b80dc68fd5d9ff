//! The decoder seam between the training loop and the network.
use candle::{DType, Module, Result, Tensor, D};
use candle_nn::{embedding, linear, ops, Embedding, Linear, VarBuilder};

use crate::config::ModelConfig;

/// Forward-pass outputs consumed by the criterion and the diagnostics.
#[derive(Debug)]
pub struct DecoderOutput {
    /// [b, t_out, mel_dim]
    pub mel_before: Tensor,
    /// [b, t_out, mel_dim], after the postnet residual
    pub mel_after: Tensor,
    /// [b, t_out]
    pub stop_logits: Tensor,
    /// [b, t_dec, t_in], present when requested
    pub att_ws: Option<Tensor>,
}

/// What the solver needs from a mel decoder. Implementations consume a
/// padded batch (teacher-forced on the target mels) and predict mel frames
/// pre/post postnet plus per-frame stop logits; attention weights are
/// returned on demand for diagnostics. `train` mirrors the candle dropout
/// convention and is false during validation.
pub trait MelDecoder {
    #[allow(clippy::too_many_arguments)]
    fn forward(
        &self,
        ppgs: &Tensor,
        in_lengths: &Tensor,
        mels: &Tensor,
        out_lengths: &Tensor,
        lf0_uvs: &Tensor,
        spk_ids: &Tensor,
        output_att_ws: bool,
        train: bool,
    ) -> Result<DecoderOutput>;
}

/// Compact attention decoder wiring the seam end to end: linear encoder
/// over [ppg, lf0-uv] with an added speaker embedding, teacher-forced
/// queries from the previous mel frame group, content-based attention with
/// padded input positions masked out, and a linear frame projection with a
/// residual postnet. A production network replaces this behind the trait.
pub struct DotAttnDecoder {
    spk_embedding: Embedding,
    encoder: Linear,
    spk_proj: Linear,
    prenet: Linear,
    mel_out: Linear,
    post_fc1: Linear,
    post_fc2: Linear,
    stop_proj: Linear,
    frames_per_step: usize,
    mel_dim: usize,
}

impl DotAttnDecoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_dim;
        let group_dim = config.frames_per_step * config.mel_dim;
        let spk_embedding = embedding(
            config.num_speakers,
            config.spk_embed_dim,
            vb.pp("spk_embedding"),
        )?;
        let encoder = linear(config.ppg_dim + 2, hidden, vb.pp("encoder"))?;
        let spk_proj = linear(config.spk_embed_dim, hidden, vb.pp("spk_proj"))?;
        let prenet = linear(group_dim, hidden, vb.pp("prenet"))?;
        let mel_out = linear(2 * hidden, group_dim, vb.pp("mel_out"))?;
        let post_fc1 = linear(config.mel_dim, hidden, vb.pp("postnet.fc1"))?;
        let post_fc2 = linear(hidden, config.mel_dim, vb.pp("postnet.fc2"))?;
        let stop_proj = linear(2 * hidden, config.frames_per_step, vb.pp("stop_proj"))?;
        Ok(Self {
            spk_embedding,
            encoder,
            spk_proj,
            prenet,
            mel_out,
            post_fc1,
            post_fc2,
            stop_proj,
            frames_per_step: config.frames_per_step,
            mel_dim: config.mel_dim,
        })
    }
}

impl MelDecoder for DotAttnDecoder {
    fn forward(
        &self,
        ppgs: &Tensor,
        in_lengths: &Tensor,
        mels: &Tensor,
        _out_lengths: &Tensor,
        lf0_uvs: &Tensor,
        spk_ids: &Tensor,
        output_att_ws: bool,
        _train: bool,
    ) -> Result<DecoderOutput> {
        let (b, t_in, _) = ppgs.dims3()?;
        let (_, t_out, mel_dim) = mels.dims3()?;
        if mel_dim != self.mel_dim {
            candle::bail!("mel dim mismatch: batch {mel_dim}, model {}", self.mel_dim)
        }
        let r = self.frames_per_step;
        if t_out % r != 0 {
            candle::bail!("t_out {t_out} not a multiple of frames_per_step {r}")
        }
        let t_dec = t_out / r;
        let device = ppgs.device();

        let enc_in = Tensor::cat(&[ppgs, lf0_uvs], D::Minus1)?;
        let enc = self.encoder.forward(&enc_in)?.relu()?;
        let spk = self.spk_proj.forward(&self.spk_embedding.forward(spk_ids)?)?;
        let enc = enc.broadcast_add(&spk.unsqueeze(1)?)?;

        // Teacher forcing: the query for decoder step t is the mel group of
        // step t-1, with a zero go-group in front.
        let groups = mels.reshape((b, t_dec, r * mel_dim))?;
        let go = Tensor::zeros((b, 1, r * mel_dim), DType::F32, device)?;
        let prev = if t_dec > 1 {
            Tensor::cat(&[&go, &groups.narrow(1, 0, t_dec - 1)?], 1)?
        } else {
            go
        };
        let queries = self.prenet.forward(&prev)?.relu()?;

        // Content-based attention; padded input positions get a large
        // negative bias before the softmax.
        let energies = queries.matmul(&enc.transpose(1, 2)?.contiguous()?)?;
        let positions = Tensor::arange(0u32, t_in as u32, device)?;
        let valid = positions
            .unsqueeze(0)?
            .broadcast_lt(&in_lengths.unsqueeze(1)?)?
            .to_dtype(DType::F32)?;
        let bias = valid.affine(1e9, -1e9)?.unsqueeze(1)?;
        let att_ws = ops::softmax(&energies.broadcast_add(&bias)?, D::Minus1)?;
        let context = att_ws.matmul(&enc)?;

        let dec = Tensor::cat(&[&context, &queries], D::Minus1)?;
        let mel_before = self.mel_out.forward(&dec)?.reshape((b, t_out, mel_dim))?;
        let residual = self
            .post_fc2
            .forward(&self.post_fc1.forward(&mel_before)?.tanh()?)?;
        let mel_after = (&mel_before + residual)?;
        let stop_logits = self.stop_proj.forward(&dec)?.reshape((b, t_out))?;

        Ok(DecoderOutput {
            mel_before,
            mel_after,
            stop_logits,
            att_ws: output_att_ws.then_some(att_ws),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;
    use candle_nn::VarMap;

    fn model_config() -> ModelConfig {
        ModelConfig {
            frames_per_step: 2,
            ppg_dim: 6,
            mel_dim: 4,
            num_speakers: 3,
            spk_embed_dim: 5,
            hidden_dim: 8,
        }
    }

    fn batch(b: usize, t_in: usize, t_out: usize) -> (Tensor, Tensor, Tensor, Tensor, Tensor, Tensor) {
        let dev = Device::Cpu;
        let ppgs = Tensor::rand(0f32, 1f32, (b, t_in, 6), &dev).unwrap();
        let lf0 = Tensor::rand(0f32, 1f32, (b, t_in, 2), &dev).unwrap();
        let mels = Tensor::rand(0f32, 1f32, (b, t_out, 4), &dev).unwrap();
        let in_lengths = Tensor::from_vec(vec![t_in as u32; b], b, &dev).unwrap();
        let out_lengths = Tensor::from_vec(vec![t_out as u32; b], b, &dev).unwrap();
        let spk_ids = Tensor::from_vec(vec![0u32; b], b, &dev).unwrap();
        (ppgs, lf0, mels, in_lengths, out_lengths, spk_ids)
    }

    #[test]
    fn forward_shapes() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = DotAttnDecoder::new(&model_config(), vb).unwrap();
        let (ppgs, lf0, mels, in_lengths, out_lengths, spk_ids) = batch(2, 7, 6);
        let out = model
            .forward(&ppgs, &in_lengths, &mels, &out_lengths, &lf0, &spk_ids, true, true)
            .unwrap();
        assert_eq!(out.mel_before.dims(), &[2, 6, 4]);
        assert_eq!(out.mel_after.dims(), &[2, 6, 4]);
        assert_eq!(out.stop_logits.dims(), &[2, 6]);
        assert_eq!(out.att_ws.unwrap().dims(), &[2, 3, 7]);
    }

    #[test]
    fn attention_ignores_padded_inputs() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = DotAttnDecoder::new(&model_config(), vb).unwrap();
        let (ppgs, lf0, mels, _, out_lengths, spk_ids) = batch(1, 8, 4);
        // Only the first 5 input frames are real.
        let in_lengths = Tensor::from_vec(vec![5u32], 1, &Device::Cpu).unwrap();
        let out = model
            .forward(&ppgs, &in_lengths, &mels, &out_lengths, &lf0, &spk_ids, true, true)
            .unwrap();
        let att = out.att_ws.unwrap().to_vec3::<f32>().unwrap();
        for row in &att[0] {
            let valid_mass: f32 = row[..5].iter().sum();
            assert!((valid_mass - 1.0).abs() < 1e-5);
            for w in &row[5..] {
                assert!(*w < 1e-6);
            }
        }
    }
}
