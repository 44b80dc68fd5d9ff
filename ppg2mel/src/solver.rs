//! Training-loop orchestration.
use std::path::{Path, PathBuf};

use candle::{DType, Device, Result};
use candle_nn::{VarBuilder, VarMap};
use tracing::info;

use crate::collate::VcCollate;
use crate::config::Config;
use crate::dataset::VcDataset;
use crate::loader::DataLoader;
use crate::loss::MaskedLoss;
use crate::model::{DotAttnDecoder, MelDecoder};
use crate::optim::ScheduledOptim;
use crate::plot;
use crate::pretrained::{self, DEFAULT_DENY_LIST};
use crate::util::{human_format, Timer};

/// Run-level knobs that do not belong in the experiment config: run name,
/// artifact locations, loader prefetch depth and the shuffle seed.
#[derive(Debug, Clone)]
pub struct TrainArgs {
    pub name: String,
    pub logdir: PathBuf,
    pub ckpdir: PathBuf,
    pub njobs: usize,
    pub seed: u64,
}

/// Mutable state owned by the orchestrator, advanced once per step or
/// validation cycle.
#[derive(Debug)]
pub struct TrainState {
    pub step: usize,
    pub best_loss: f32,
    pub timer: Timer,
}

impl Default for TrainState {
    fn default() -> Self {
        Self {
            step: 0,
            best_loss: f32::INFINITY,
            timer: Timer::new(),
        }
    }
}

impl TrainState {
    /// Records `loss` as the new best when it strictly improves on every
    /// previously observed validation loss.
    pub fn update_best(&mut self, loss: f32) -> bool {
        if loss < self.best_loss {
            self.best_loss = loss;
            true
        } else {
            false
        }
    }
}

/// Mean losses over one validation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidStats {
    pub loss: f32,
    pub mel_loss: f32,
    pub stop_loss: f32,
}

/// Drives training end to end: data loading, model/optimizer setup, the
/// step loop with periodic validation, checkpointing and attention plots.
pub struct Solver {
    config: Config,
    args: TrainArgs,
    device: Device,
    varmap: VarMap,
    criterion: MaskedLoss,
    model: Option<Box<dyn MelDecoder>>,
    optimizer: Option<ScheduledOptim>,
    train_loader: Option<DataLoader>,
    dev_loader: Option<DataLoader>,
    plot_loader: Option<DataLoader>,
    state: TrainState,
    ckpt_dir: PathBuf,
    att_ws_dir: PathBuf,
}

impl Solver {
    pub fn new(config: Config, args: TrainArgs, device: Device) -> Result<Self> {
        config.validate()?;
        let ckpt_dir = args.ckpdir.join(&args.name);
        let att_ws_dir = args.logdir.join(&args.name).join("att_ws");
        std::fs::create_dir_all(&ckpt_dir)?;
        std::fs::create_dir_all(&att_ws_dir)?;
        let criterion = MaskedLoss::new(config.model.frames_per_step);
        Ok(Self {
            config,
            args,
            device,
            varmap: VarMap::new(),
            criterion,
            model: None,
            optimizer: None,
            train_loader: None,
            dev_loader: None,
            plot_loader: None,
            state: TrainState::default(),
            ckpt_dir,
            att_ws_dir,
        })
    }

    pub fn state(&self) -> &TrainState {
        &self.state
    }

    pub fn ckpt_dir(&self) -> &Path {
        &self.ckpt_dir
    }

    pub fn att_ws_dir(&self) -> &Path {
        &self.att_ws_dir
    }

    /// Builds the train/dev/plot loaders from the configured corpus.
    pub fn load_data(&mut self) -> Result<()> {
        let data = &self.config.data;
        let frames_per_step = self.config.model.frames_per_step;
        let batch_size = self.config.hparas.batch_size;
        let prefetch = self.args.njobs.max(1);

        let train_set = VcDataset::load(
            &data.train_fid_list,
            &data.ppg_dir,
            &data.f0_dir,
            &data.mel_dir,
            &data.ppg_file_ext,
        )?;
        let dev_set = VcDataset::load(
            &data.dev_fid_list,
            &data.ppg_dir,
            &data.f0_dir,
            &data.mel_dir,
            &data.ppg_file_ext,
        )?;
        let plot_set = VcDataset::load(
            &data.dev_fid_list,
            &data.ppg_dir,
            &data.f0_dir,
            &data.mel_dir,
            &data.ppg_file_ext,
        )?;
        info!(
            train = train_set.len(),
            dev = dev_set.len(),
            "prepared training set and dev set"
        );

        self.train_loader = Some(DataLoader::new(
            train_set,
            VcCollate::new(frames_per_step),
            batch_size,
            true,
            true,
            prefetch,
            self.args.seed,
        )?);
        self.dev_loader = Some(DataLoader::new(
            dev_set,
            VcCollate::new(frames_per_step),
            batch_size,
            false,
            false,
            prefetch,
            self.args.seed,
        )?);
        self.plot_loader = Some(DataLoader::new(
            plot_set,
            VcCollate::new(frames_per_step).give_fids(true),
            1,
            false,
            false,
            1,
            self.args.seed,
        )?);
        Ok(())
    }

    /// Builds the decoder and the scheduled optimizer; merges pre-trained
    /// parameters when a checkpoint is configured.
    pub fn set_model(&mut self) -> Result<()> {
        let vb = VarBuilder::from_varmap(&self.varmap, DType::F32, &self.device);
        let model = DotAttnDecoder::new(&self.config.model, vb)?;
        self.model = Some(Box::new(model));

        if let Some(path) = &self.config.data.pretrain_model_file {
            let report = pretrained::merge_pretrained(
                &self.varmap,
                path,
                true,
                DEFAULT_DENY_LIST,
                &self.device,
            )?;
            info!(path = %path.display(), "merged pretrained parameters: {}", report.summary());
        }

        let optimizer = ScheduledOptim::new(self.varmap.all_vars(), &self.config.hparas.optimizer)?;
        info!("{}", optimizer.create_msg());
        self.optimizer = Some(optimizer);
        Ok(())
    }

    /// The main step loop. Terminates on the configured max step; epochs are
    /// bookkeeping only.
    pub fn exec(&mut self) -> Result<()> {
        let model = self
            .model
            .take()
            .ok_or_else(|| candle::Error::Msg("set_model must run before exec".to_string()))?;
        let mut optimizer = self
            .optimizer
            .take()
            .ok_or_else(|| candle::Error::Msg("set_model must run before exec".to_string()))?;

        let max_step = self.config.hparas.max_step;
        let progress_step = self.config.hparas.progress_step;
        let valid_step = self.config.hparas.valid_step;
        info!("total training steps {}", human_format(max_step));

        let mut epoch = 0u64;
        self.state.timer.set();
        while self.state.step < max_step {
            let stream = match self.train_loader.as_ref() {
                Some(loader) => loader.iter_epoch(epoch),
                None => candle::bail!("load_data must run before exec"),
            };
            for batch in stream {
                let lr = optimizer.pre_step(self.state.step);
                let batch = batch?.to_device(&self.device)?;
                self.state.timer.cnt_read();

                let out = model.forward(
                    &batch.ppgs,
                    &batch.in_lengths,
                    &batch.mels,
                    &batch.out_lengths,
                    &batch.lf0_uvs,
                    &batch.spk_ids,
                    false,
                    true,
                )?;
                let (mel_loss, stop_loss) = self.criterion.forward(
                    &out.mel_before,
                    &out.mel_after,
                    &batch.mels,
                    &batch.out_lengths,
                    &batch.stop_tokens,
                    &out.stop_logits,
                )?;
                let loss = (&mel_loss + &stop_loss)?;
                let grad_norm = optimizer.backward_step(&loss)?;
                self.state.timer.cnt_compute();
                self.state.step += 1;

                if self.state.step == 1 || self.state.step % progress_step == 0 {
                    let loss = loss.to_scalar::<f32>()?;
                    let mel_loss = mel_loss.to_scalar::<f32>()?;
                    let stop_loss = stop_loss.to_scalar::<f32>()?;
                    info!(
                        step = self.state.step,
                        loss,
                        mel_loss,
                        stop_loss,
                        grad_norm,
                        lr,
                        time = %self.state.timer.show(),
                        "tr"
                    );
                }
                if self.state.step == 1 || self.state.step % valid_step == 0 {
                    self.validate_inner(model.as_ref())?;
                }

                if !matches!(self.device, Device::Cpu) {
                    self.device.synchronize()?;
                }
                self.state.timer.set();
                if self.state.step >= max_step {
                    break;
                }
            }
            epoch += 1;
        }

        self.model = Some(model);
        self.optimizer = Some(optimizer);
        Ok(())
    }

    /// Full pass over the held-out set plus checkpointing and attention
    /// plots. Usable standalone once data and model are set up.
    pub fn validate(&mut self) -> Result<ValidStats> {
        let model = self
            .model
            .take()
            .ok_or_else(|| candle::Error::Msg("set_model must run before validate".to_string()))?;
        let result = self.validate_inner(model.as_ref());
        self.model = Some(model);
        result
    }

    fn validate_inner(&mut self, model: &dyn MelDecoder) -> Result<ValidStats> {
        let stream = match self.dev_loader.as_ref() {
            Some(loader) => loader.iter_epoch(0),
            None => candle::bail!("load_data must run before validate"),
        };
        let mut total = 0f32;
        let mut mel_total = 0f32;
        let mut stop_total = 0f32;
        let mut batches = 0usize;
        for batch in stream {
            let batch = batch?.to_device(&self.device)?;
            let out = model.forward(
                &batch.ppgs,
                &batch.in_lengths,
                &batch.mels,
                &batch.out_lengths,
                &batch.lf0_uvs,
                &batch.spk_ids,
                false,
                false,
            )?;
            let (mel_loss, stop_loss) = self.criterion.forward(
                &out.mel_before,
                &out.mel_after,
                &batch.mels,
                &batch.out_lengths,
                &batch.stop_tokens,
                &out.stop_logits,
            )?;
            mel_total += mel_loss.to_scalar::<f32>()?;
            stop_total += stop_loss.to_scalar::<f32>()?;
            total += (&mel_loss + &stop_loss)?.to_scalar::<f32>()?;
            batches += 1;
        }
        if batches == 0 {
            candle::bail!("dev set produced no batches")
        }
        let stats = ValidStats {
            loss: total / batches as f32,
            mel_loss: mel_total / batches as f32,
            stop_loss: stop_total / batches as f32,
        };

        // Every validation writes the step checkpoint; an improving one
        // additionally writes the best-marker file.
        let step = self.state.step;
        self.varmap
            .save(self.ckpt_dir.join(format!("step_{step}.safetensors")))?;
        if self.state.update_best(stats.loss) {
            self.varmap.save(
                self.ckpt_dir
                    .join(format!("best_loss_step_{step}.safetensors")),
            )?;
        }
        info!(
            step,
            loss = stats.loss,
            mel_loss = stats.mel_loss,
            stop_loss = stats.stop_loss,
            "dv"
        );

        self.plot_attention(model, step)?;
        Ok(stats)
    }

    fn plot_attention(&self, model: &dyn MelDecoder, step: usize) -> Result<()> {
        let stream = match self.plot_loader.as_ref() {
            Some(loader) => loader.iter_epoch(0),
            None => candle::bail!("load_data must run before validate"),
        };
        let mut plotted = 0usize;
        for batch in stream {
            if plotted == self.config.hparas.num_att_plots {
                break;
            }
            let batch = batch?.to_device(&self.device)?;
            let fid = batch
                .fids
                .as_ref()
                .and_then(|fids| fids.first())
                .cloned()
                .ok_or_else(|| {
                    candle::Error::Msg("plot loader did not attach utterance ids".to_string())
                })?;
            let out = model.forward(
                &batch.ppgs,
                &batch.in_lengths,
                &batch.mels,
                &batch.out_lengths,
                &batch.lf0_uvs,
                &batch.spk_ids,
                true,
                false,
            )?;
            let att_ws = out.att_ws.ok_or_else(|| {
                candle::Error::Msg("decoder did not return attention weights".to_string())
            })?;
            let att_ws = att_ws
                .squeeze(0)?
                .to_device(&Device::Cpu)?
                .to_vec2::<f32>()?;
            let path = self.att_ws_dir.join(format!("{fid}_step{step}.png"));
            plot::save_attention_map(&path, &att_ws, &fid)
                .map_err(|e| candle::Error::Msg(format!("attention plot for {fid}: {e}")))?;
            plotted += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_loss_updates_only_on_strict_improvement() {
        let mut state = TrainState::default();
        assert!(state.update_best(1.5));
        assert!(!state.update_best(1.5));
        assert!(!state.update_best(2.0));
        assert!(state.update_best(1.2));
        assert_eq!(state.best_loss, 1.2);
    }
}
