//! Batch streaming with background prefetch.
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use candle::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::collate::{Batch, VcCollate};
use crate::dataset::VcDataset;

/// Iterates a dataset in collated batches, one epoch at a time. Each epoch
/// runs a worker thread that loads, collates and pushes ready batches
/// through a bounded channel; the consumer side sees them strictly in
/// order. Shuffling is keyed by `seed + epoch` so runs are reproducible.
#[derive(Debug)]
pub struct DataLoader {
    dataset: Arc<VcDataset>,
    collate: VcCollate,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    prefetch: usize,
    seed: u64,
}

impl DataLoader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dataset: VcDataset,
        collate: VcCollate,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
        prefetch: usize,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            candle::bail!("batch_size must be at least 1")
        }
        Ok(Self {
            dataset: Arc::new(dataset),
            collate,
            batch_size,
            shuffle,
            drop_last,
            prefetch,
            seed,
        })
    }

    pub fn num_utterances(&self) -> usize {
        self.dataset.len()
    }

    pub fn num_batches(&self) -> usize {
        if self.drop_last {
            self.dataset.len() / self.batch_size
        } else {
            self.dataset.len().div_ceil(self.batch_size)
        }
    }

    pub fn iter_epoch(&self, epoch: u64) -> BatchStream {
        let (tx, rx) = sync_channel::<Result<Batch>>(self.prefetch.max(1));
        let dataset = self.dataset.clone();
        let collate = self.collate.clone();
        let batch_size = self.batch_size;
        let shuffle = self.shuffle;
        let drop_last = self.drop_last;
        let seed = self.seed.wrapping_add(epoch);

        let worker = std::thread::spawn(move || {
            let mut indices: Vec<usize> = (0..dataset.len()).collect();
            if shuffle {
                let mut rng = StdRng::seed_from_u64(seed);
                indices.shuffle(&mut rng);
            }
            for chunk in indices.chunks(batch_size) {
                if drop_last && chunk.len() < batch_size {
                    break;
                }
                let items: Result<Vec<_>> = chunk.iter().map(|&i| dataset.get(i)).collect();
                let batch = items.and_then(|items| collate.collate(&items));
                let failed = batch.is_err();
                if tx.send(batch).is_err() || failed {
                    // Receiver dropped, or the consumer will abort on the
                    // forwarded error anyway.
                    break;
                }
            }
        });

        BatchStream {
            rx: Some(rx),
            worker: Some(worker),
        }
    }
}

/// One epoch worth of batches. Dropping the stream drops the channel first
/// so a blocked worker unblocks, then joins it.
pub struct BatchStream {
    rx: Option<Receiver<Result<Batch>>>,
    worker: Option<JoinHandle<()>>,
}

impl Iterator for BatchStream {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.as_ref()?.recv().ok()
    }
}

impl Drop for BatchStream {
    fn drop(&mut self) {
        self.rx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{Device, Tensor};
    use std::path::Path;

    fn make_corpus(root: &Path, n: usize) -> VcDataset {
        let dev = Device::Cpu;
        for sub in ["ppg", "lf0", "mel"] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
        }
        let mut lines = String::new();
        for i in 0..n {
            let fid = format!("utt{i}");
            let t_in = 4 + i;
            let t_out = 6 + i;
            Tensor::rand(0f32, 1f32, (t_in, 3), &dev)
                .unwrap()
                .write_npy(root.join("ppg").join(format!("{fid}.npy")))
                .unwrap();
            Tensor::rand(0f32, 1f32, (t_in, 2), &dev)
                .unwrap()
                .write_npy(root.join("lf0").join(format!("{fid}.npy")))
                .unwrap();
            Tensor::rand(0f32, 1f32, (t_out, 4), &dev)
                .unwrap()
                .write_npy(root.join("mel").join(format!("{fid}.npy")))
                .unwrap();
            lines.push_str(&format!("{fid}|0\n"));
        }
        std::fs::write(root.join("fids.lst"), lines).unwrap();
        VcDataset::load(
            root.join("fids.lst"),
            root.join("ppg"),
            root.join("lf0"),
            root.join("mel"),
            "npy",
        )
        .unwrap()
    }

    #[test]
    fn drop_last_controls_batch_count() {
        let tmp = tempfile::tempdir().unwrap();
        let ds = make_corpus(tmp.path(), 5);
        let loader =
            DataLoader::new(ds, VcCollate::new(2), 2, false, true, 1, 0).unwrap();
        assert_eq!(loader.num_batches(), 2);
        let batches: Vec<_> = loader.iter_epoch(0).collect();
        assert_eq!(batches.len(), 2);

        let tmp = tempfile::tempdir().unwrap();
        let ds = make_corpus(tmp.path(), 5);
        let loader =
            DataLoader::new(ds, VcCollate::new(2), 2, false, false, 1, 0).unwrap();
        assert_eq!(loader.num_batches(), 3);
        let last = loader.iter_epoch(0).last().unwrap().unwrap();
        assert_eq!(last.batch_size(), 1);
    }

    #[test]
    fn shuffle_is_reproducible_per_seed() {
        let tmp = tempfile::tempdir().unwrap();
        let ds = make_corpus(tmp.path(), 6);
        let loader =
            DataLoader::new(ds, VcCollate::new(2).give_fids(true), 2, true, true, 1, 7).unwrap();
        let order = |epoch| -> Vec<String> {
            loader
                .iter_epoch(epoch)
                .flat_map(|b| b.unwrap().fids.unwrap())
                .collect()
        };
        assert_eq!(order(0), order(0));
        let mut seen = order(0);
        seen.sort();
        assert_eq!(seen, (0..6).map(|i| format!("utt{i}")).collect::<Vec<_>>());
    }
}
