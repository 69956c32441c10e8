//! Wiring for a full training run: device, datasets, model, optimizer,
//! run directory and sinks around [`TrainingLoop`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use candle_core::Device;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use serde::Serialize;
use tracing::{info, warn};
use yomite_core::{
    AnswerIndex, DatasetSplit, JsonlSummaryWriter, StepRunner, TrainingConfig, TrainingLoop,
    TrainingReport, Vocabulary,
};

use crate::checkpoint::VarMapCheckpointer;
use crate::model::{ReaderConfig, StanfordReader};

/// Name of the vocabulary file inside the data directory.
pub const VOCAB_FILE: &str = "vocab.json";

/// Where device placement should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub cuda: bool,
    pub cuda_ordinal: usize,
    pub allow_soft_placement: bool,
    pub log_device_placement: bool,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            cuda: false,
            cuda_ordinal: 0,
            allow_soft_placement: true,
            log_device_placement: false,
        }
    }
}

/// Pick the compute device. A failed CUDA request falls back to the CPU
/// only when soft placement is allowed.
pub fn select_device(placement: Placement) -> anyhow::Result<Device> {
    let device = if placement.cuda {
        match Device::new_cuda(placement.cuda_ordinal) {
            Ok(device) => device,
            Err(e) if placement.allow_soft_placement => {
                warn!(
                    "CUDA device {} unavailable ({}), placing on CPU",
                    placement.cuda_ordinal, e
                );
                Device::Cpu
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("CUDA device {} unavailable", placement.cuda_ordinal)
                });
            }
        }
    } else {
        Device::Cpu
    };

    if placement.log_device_placement {
        info!("Device placement: {:?}", device);
    }
    Ok(device)
}

/// Timestamped output directory of a single run.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    root: PathBuf,
}

impl RunDirectory {
    /// Create `<output_root>/runs/<timestamp>/` with its summary and
    /// checkpoint subdirectories.
    pub fn create<P: AsRef<Path>>(output_root: P, timestamp: u64) -> anyhow::Result<Self> {
        let root = output_root
            .as_ref()
            .join("runs")
            .join(timestamp.to_string());
        let run = Self { root };
        for dir in [run.summaries("train"), run.summaries("dev"), run.checkpoints()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(run)
    }

    /// Create a run directory named after the current unix time.
    pub fn create_now<P: AsRef<Path>>(output_root: P) -> anyhow::Result<Self> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("System clock is before the unix epoch")?
            .as_secs();
        Self::create(output_root, timestamp)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn summaries(&self, kind: &str) -> PathBuf {
        self.root.join("summaries").join(kind)
    }

    pub fn checkpoints(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn vocab_path(&self) -> PathBuf {
        self.root.join("vocab")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }
}

/// Everything a run needs besides the stop flag.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub data_dir: PathBuf,
    pub output_root: PathBuf,
    pub answer_index: PathBuf,
    /// Documents are cut to this many tokens.
    pub max_document_length: usize,
    /// Keep only the first N samples of each split.
    pub limit_samples: Option<usize>,
    pub learning_rate: f64,
    pub training: TrainingConfig,
    /// `vocab_size` is filled in from the vocabulary; `max_entities` must
    /// match the answer index.
    pub reader: ReaderConfig,
    pub placement: Placement,
}

#[derive(Serialize)]
struct RunManifest<'a> {
    learning_rate: f64,
    max_document_length: usize,
    limit_samples: Option<usize>,
    training: &'a TrainingConfig,
    reader: &'a ReaderConfig,
}

fn load_split(options: &RunOptions, name: &str, device: &Device) -> anyhow::Result<DatasetSplit> {
    let mut split = DatasetSplit::load(&options.data_dir, name, device)
        .with_context(|| format!("Failed to load {} split", name))?
        .truncate_tokens(options.max_document_length)?;
    if let Some(limit) = options.limit_samples {
        split = split.limit(limit)?;
    }
    info!(
        "{} split: {} samples, {} document tokens, {} question tokens",
        name,
        split.len(),
        split.token_axis_length(),
        split.question_length()
    );
    Ok(split)
}

/// Load everything, train, and return the loop's report.
pub fn run_training(options: RunOptions, stop: Arc<AtomicBool>) -> anyhow::Result<TrainingReport> {
    if options.learning_rate <= 0.0 {
        bail!("learning rate must be positive, got {}", options.learning_rate);
    }
    let device = select_device(options.placement)?;

    let vocab_path = options.data_dir.join(VOCAB_FILE);
    let vocab = Vocabulary::load(&vocab_path)
        .with_context(|| format!("Failed to load vocabulary {}", vocab_path.display()))?;
    info!("Vocabulary size: {}", vocab.len());

    let answer_index = AnswerIndex::from_file(&options.answer_index).with_context(|| {
        format!("Failed to load answer index {}", options.answer_index.display())
    })?;

    let train = load_split(&options, "train", &device)?;
    let validation = load_split(&options, "val", &device)?;

    if options.reader.max_entities != answer_index.max_entities() {
        bail!(
            "max_entities is {} but answer index {} has {} slots",
            options.reader.max_entities,
            options.answer_index.display(),
            answer_index.max_entities()
        );
    }

    let reader_config = ReaderConfig {
        vocab_size: vocab.len(),
        ..options.reader.clone()
    };

    let run = RunDirectory::create_now(&options.output_root)?;
    info!("Writing to {}", run.root().display());
    vocab
        .save(run.vocab_path())
        .context("Failed to write vocabulary")?;
    let manifest = RunManifest {
        learning_rate: options.learning_rate,
        max_document_length: options.max_document_length,
        limit_samples: options.limit_samples,
        training: &options.training,
        reader: &reader_config,
    };
    fs::write(run.config_path(), serde_json::to_string_pretty(&manifest)?)
        .context("Failed to write run configuration")?;

    let varmap = VarMap::new();
    let model = StanfordReader::new(reader_config, &varmap, &device)?;
    let params = ParamsAdamW {
        lr: options.learning_rate,
        weight_decay: 0.0,
        ..Default::default()
    };
    let optimizer = AdamW::new(varmap.all_vars(), params)?;
    let runner = StepRunner::new(model, optimizer, answer_index, options.training.clip_norm);

    let mut training = TrainingLoop::new(options.training.clone(), runner, &train, &validation, &device)
        .context("Failed to prepare training loop")?
        .with_stop_flag(stop);

    let mut train_sink = JsonlSummaryWriter::create(run.summaries("train"))?;
    let mut dev_sink = JsonlSummaryWriter::create(run.summaries("dev"))?;
    let mut checkpoints = VarMapCheckpointer::new(&varmap, run.checkpoints())?;

    let report = training
        .run(&mut train_sink, &mut dev_sink, &mut checkpoints)
        .context("Training failed")?;

    info!(
        "Finished after {} steps ({:?}), {} evaluations, {} checkpoints",
        report.state.global_step, report.stop_reason, report.evaluations, report.checkpoints
    );
    if let Some(last) = report.last_validation {
        info!(
            "Last validation at step {}: loss {:.6}, acc {:.6}",
            last.step, last.loss, last.accuracy
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;
    use yomite_core::StopReason;

    fn write_split(dir: &Path, name: &str, samples: usize, tokens: usize) {
        let dev = Device::Cpu;
        let documents: Vec<u32> = (0..samples * tokens).map(|i| (i % 9) as u32 + 1).collect();
        let questions: Vec<u32> = (0..samples * 3).map(|i| (i % 4) as u32 + 1).collect();
        let choices: Vec<u32> = (0..samples).flat_map(|_| [1u32, 2, 0]).collect();
        let answers: Vec<u32> = (0..samples).map(|i| if i % 2 == 0 { 1 } else { 2 }).collect();

        Tensor::from_vec(documents, (samples, tokens), &dev)
            .unwrap()
            .write_npy(dir.join(format!("x_{name}_d.npy")))
            .unwrap();
        Tensor::from_vec(questions, (samples, 3), &dev)
            .unwrap()
            .write_npy(dir.join(format!("x_{name}_q.npy")))
            .unwrap();
        Tensor::from_vec(choices, (samples, 3), &dev)
            .unwrap()
            .write_npy(dir.join(format!("y_{name}_choices.npy")))
            .unwrap();
        Tensor::from_vec(answers, samples, &dev)
            .unwrap()
            .write_npy(dir.join(format!("y_{name}.npy")))
            .unwrap();
    }

    fn fixture(root: &Path) -> RunOptions {
        let data = root.join("data");
        fs::create_dir_all(&data).unwrap();
        write_split(&data, "train", 12, 8);
        write_split(&data, "val", 4, 8);
        let tokens = (0..10).map(|i| format!("tok{i}")).collect();
        Vocabulary::new(tokens).save(data.join(VOCAB_FILE)).unwrap();
        let answer_index = root.join("answer_index.json");
        AnswerIndex::from_slots([(1, 0), (2, 1)], 3)
            .unwrap()
            .save(&answer_index)
            .unwrap();

        RunOptions {
            data_dir: data,
            output_root: root.join("out"),
            answer_index,
            max_document_length: 6,
            limit_samples: None,
            learning_rate: 0.01,
            training: TrainingConfig::new()
                .with_batch_size(4)
                .with_num_epochs(2)
                .with_window_sizes(3, 2)
                .with_intervals(3, 4)
                .with_seed(3),
            reader: ReaderConfig {
                embedding_dim: 6,
                hidden_units: 4,
                max_entities: 3,
                ..ReaderConfig::default()
            },
            placement: Placement::default(),
        }
    }

    #[test]
    fn run_directory_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let run = RunDirectory::create(tmp.path(), 1700000000).unwrap();
        assert_eq!(run.root(), tmp.path().join("runs").join("1700000000"));
        assert!(run.summaries("train").is_dir());
        assert!(run.summaries("dev").is_dir());
        assert!(run.checkpoints().is_dir());
    }

    #[test]
    fn cpu_placement_by_default() {
        let device = select_device(Placement::default()).unwrap();
        assert!(device.is_cpu());
    }

    #[test]
    fn small_run_end_to_end() {
        let tmp = tempfile::tempdir().unwrap();
        let options = fixture(tmp.path());
        let report = run_training(options, Arc::new(AtomicBool::new(false))).unwrap();

        // 12 samples / 4 = 3 batches, 2 epochs.
        assert_eq!(report.state.global_step, 6);
        assert_eq!(report.stop_reason, StopReason::Exhausted);
        assert_eq!(report.evaluations, 2);
        assert_eq!(report.checkpoints, 1);

        let runs: Vec<_> = fs::read_dir(tmp.path().join("out").join("runs"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert!(run.join("vocab").is_file());
        assert!(run.join("config.json").is_file());
        assert!(run.join("checkpoints").join("model-4.safetensors").is_file());
        let dev_events = fs::read_to_string(run.join("summaries/dev/events.jsonl")).unwrap();
        assert_eq!(dev_events.lines().count(), 2);
    }

    #[test]
    fn raised_stop_flag_trains_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let options = fixture(tmp.path());
        let report = run_training(options, Arc::new(AtomicBool::new(true))).unwrap();
        assert_eq!(report.state.global_step, 0);
        assert_eq!(report.stop_reason, StopReason::Interrupted);
    }

    #[test]
    fn max_entities_must_match_the_answer_index() {
        let tmp = tempfile::tempdir().unwrap();
        let mut options = fixture(tmp.path());
        options.reader.max_entities = 7;
        let err = run_training(options, Arc::new(AtomicBool::new(false))).unwrap_err();
        assert!(err.to_string().contains("max_entities is 7"));
        assert!(!tmp.path().join("out").exists());
    }

    #[test]
    fn missing_vocabulary_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let options = fixture(tmp.path());
        fs::remove_file(options.data_dir.join(VOCAB_FILE)).unwrap();
        let err = run_training(options, Arc::new(AtomicBool::new(false))).unwrap_err();
        assert!(err.to_string().contains("vocabulary"));
    }
}
