//! Length-masked training criterion.
use candle::{DType, Result, Tensor};
use candle_nn::ops;

/// Masked MSE over pre- and post-postnet mel predictions plus stop-token
/// binary cross-entropy. Mel frames are masked by the true output lengths;
/// the stop term uses lengths rounded up to the frames-per-step factor so
/// the stop position itself (which can sit past the true length) is kept.
pub struct MaskedLoss {
    frames_per_step: usize,
}

impl MaskedLoss {
    pub fn new(frames_per_step: usize) -> Self {
        Self { frames_per_step }
    }

    pub fn forward(
        &self,
        mel_before: &Tensor,
        mel_after: &Tensor,
        mels: &Tensor,
        out_lengths: &Tensor,
        stop_tokens: &Tensor,
        stop_logits: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let (_b, t_out, mel_dim) = mels.dims3()?;
        let device = mels.device();
        let lengths = out_lengths.to_dtype(DType::F32)?;
        let positions = Tensor::arange(0u32, t_out as u32, device)?.to_dtype(DType::F32)?;

        // [b, t_out], 1.0 on frames inside the true length
        let mel_mask = positions
            .unsqueeze(0)?
            .broadcast_lt(&lengths.unsqueeze(1)?)?
            .to_dtype(DType::F32)?;
        let n_frames = mel_mask.sum_all()?.to_scalar::<f32>()? as f64;
        if n_frames == 0. {
            candle::bail!("all output lengths in the batch are zero")
        }
        let mask3 = mel_mask.unsqueeze(2)?;
        let denom = n_frames * mel_dim as f64;
        let mse_before = masked_mse(mel_before, mels, &mask3, denom)?;
        let mse_after = masked_mse(mel_after, mels, &mask3, denom)?;
        let mel_loss = (mse_before + mse_after)?;

        // Stop mask covers the rounded lengths.
        let r = self.frames_per_step as f64;
        let rounded = lengths.affine(1. / r, (r - 1.) / r)?.floor()?.affine(r, 0.)?;
        let stop_mask = positions
            .unsqueeze(0)?
            .broadcast_lt(&rounded.unsqueeze(1)?)?
            .to_dtype(DType::F32)?;
        let n_stop = stop_mask.sum_all()?.to_scalar::<f32>()? as f64;

        let probs = ops::sigmoid(stop_logits)?;
        let left = (stop_tokens * probs.log()?)?;
        let right = (stop_tokens.affine(-1., 1.)? * probs.affine(-1., 1.)?.log()?)?;
        let bce = (left + right)?.neg()?;
        let stop_loss = (bce * stop_mask)?.sum_all()?.affine(1. / n_stop, 0.)?;

        Ok((mel_loss, stop_loss))
    }
}

fn masked_mse(pred: &Tensor, target: &Tensor, mask3: &Tensor, denom: f64) -> Result<Tensor> {
    (pred - target)?
        .sqr()?
        .broadcast_mul(mask3)?
        .sum_all()?
        .affine(1. / denom, 0.)
}
