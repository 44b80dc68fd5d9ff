//! Per-utterance feature loading.
use std::path::{Path, PathBuf};

use candle::{DType, Result, Tensor};

/// One training record: matched PPG / lf0-uv / mel matrices plus speaker id.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub fid: String,
    pub spk_id: u32,
    /// [t_in, ppg_dim]
    pub ppg: Tensor,
    /// [t_in, 2]
    pub lf0_uv: Tensor,
    /// [t_out, mel_dim]
    pub mel: Tensor,
}

/// Utterances enumerated by a fid-list file, one `fid|spk` per line (a bare
/// fid maps to speaker 0). Features are read lazily from npy files.
#[derive(Debug)]
pub struct VcDataset {
    entries: Vec<(String, u32)>,
    ppg_dir: PathBuf,
    f0_dir: PathBuf,
    mel_dir: PathBuf,
    ppg_file_ext: String,
}

impl VcDataset {
    pub fn load<P: AsRef<Path>>(
        meta_file: P,
        ppg_dir: P,
        f0_dir: P,
        mel_dir: P,
        ppg_file_ext: &str,
    ) -> Result<Self> {
        let meta_file = meta_file.as_ref();
        let content = std::fs::read_to_string(meta_file)?;
        let mut entries = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (fid, spk_id) = match line.split_once('|') {
                Some((fid, spk)) => {
                    let spk_id = spk.trim().parse::<u32>().map_err(|e| {
                        candle::Error::Msg(format!(
                            "bad speaker id {spk:?} for {fid} in {meta_file:?}: {e}"
                        ))
                    })?;
                    (fid.trim().to_string(), spk_id)
                }
                None => (line.to_string(), 0),
            };
            entries.push((fid, spk_id));
        }
        if entries.is_empty() {
            candle::bail!("no utterances listed in {meta_file:?}")
        }
        Ok(Self {
            entries,
            ppg_dir: ppg_dir.as_ref().to_path_buf(),
            f0_dir: f0_dir.as_ref().to_path_buf(),
            mel_dir: mel_dir.as_ref().to_path_buf(),
            ppg_file_ext: ppg_file_ext.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fid(&self, idx: usize) -> Option<&str> {
        self.entries.get(idx).map(|(fid, _)| fid.as_str())
    }

    pub fn get(&self, idx: usize) -> Result<Utterance> {
        let (fid, spk_id) = match self.entries.get(idx) {
            Some(e) => e,
            None => candle::bail!("utterance index {idx} out of range ({})", self.entries.len()),
        };
        let ppg_path = self.ppg_dir.join(format!("{fid}.{}", self.ppg_file_ext));
        let f0_path = self.f0_dir.join(format!("{fid}.npy"));
        let mel_path = self.mel_dir.join(format!("{fid}.npy"));

        let ppg = Tensor::read_npy(&ppg_path)?.to_dtype(DType::F32)?;
        let lf0_uv = Tensor::read_npy(&f0_path)?.to_dtype(DType::F32)?;
        let mel = Tensor::read_npy(&mel_path)?.to_dtype(DType::F32)?;

        let (t_ppg, _) = ppg.dims2()?;
        let (t_f0, f0_dim) = lf0_uv.dims2()?;
        if f0_dim != 2 {
            candle::bail!("{f0_path:?}: expected lf0-uv with 2 columns, got {f0_dim}")
        }
        mel.dims2()?;

        // PPG and lf0-uv extractors can disagree by a frame; align on the
        // shorter of the two.
        let t_in = t_ppg.min(t_f0);
        let ppg = ppg.narrow(0, 0, t_in)?;
        let lf0_uv = lf0_uv.narrow(0, 0, t_in)?;

        Ok(Utterance {
            fid: fid.clone(),
            spk_id: *spk_id,
            ppg,
            lf0_uv,
            mel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;

    fn write_utt(dir: &Path, fid: &str, t_in: usize, t_out: usize) {
        let dev = Device::Cpu;
        let ppg = Tensor::rand(0f32, 1f32, (t_in, 6), &dev).unwrap();
        let lf0 = Tensor::rand(0f32, 1f32, (t_in + 1, 2), &dev).unwrap();
        let mel = Tensor::rand(0f32, 1f32, (t_out, 4), &dev).unwrap();
        ppg.write_npy(dir.join("ppg").join(format!("{fid}.ling.npy"))).unwrap();
        lf0.write_npy(dir.join("lf0").join(format!("{fid}.npy"))).unwrap();
        mel.write_npy(dir.join("mel").join(format!("{fid}.npy"))).unwrap();
    }

    #[test]
    fn loads_and_aligns_utterances() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        for sub in ["ppg", "lf0", "mel"] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
        }
        write_utt(root, "utt_a", 10, 17);
        write_utt(root, "utt_b", 7, 12);
        std::fs::write(root.join("train.lst"), "utt_a|1\nutt_b\n").unwrap();

        let ds = VcDataset::load(
            root.join("train.lst"),
            root.join("ppg"),
            root.join("lf0"),
            root.join("mel"),
            "ling.npy",
        )
        .unwrap();
        assert_eq!(ds.len(), 2);

        let utt = ds.get(0).unwrap();
        assert_eq!(utt.fid, "utt_a");
        assert_eq!(utt.spk_id, 1);
        // lf0 has one extra frame on disk; both inputs align on the shorter.
        assert_eq!(utt.ppg.dims2().unwrap(), (10, 6));
        assert_eq!(utt.lf0_uv.dims2().unwrap(), (10, 2));
        assert_eq!(utt.mel.dims2().unwrap(), (17, 4));

        let utt = ds.get(1).unwrap();
        assert_eq!(utt.spk_id, 0);
        assert!(ds.get(2).is_err());
    }

    #[test]
    fn rejects_empty_fid_list() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::write(root.join("empty.lst"), "\n\n").unwrap();
        let ds = VcDataset::load(
            root.join("empty.lst"),
            root.join("ppg"),
            root.join("lf0"),
            root.join("mel"),
            "npy",
        );
        assert!(ds.is_err());
    }
}
