//! # Training and Evaluation Steps
//!
//! A step turns a [`Batch`] into the reader's input feed, runs the model
//! and, when training, clips every gradient tensor and applies the
//! optimizer update. The model itself is opaque: anything implementing
//! [`ReaderModel`] can be driven.

use candle_core::{DType, Tensor, Var};
use candle_nn::Optimizer;
use serde::{Deserialize, Serialize};

use crate::answer::AnswerIndex;
use crate::data::Batch;
use crate::error::{Result, YomiteError};
use crate::summary::{zero_fraction, Histogram, Summary};
use crate::window::BatchMask;

/// Whether a step updates the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Forward, backward and optimizer update.
    Train,
    /// Forward only.
    Evaluate,
}

/// Everything the reader consumes for one batch.
#[derive(Debug, Clone)]
pub struct ReaderFeed {
    /// `[batch, tokens]` document ids.
    pub documents: Tensor,
    /// `[batch, question_tokens]` question ids.
    pub questions: Tensor,
    /// `[batch]` gold answer slots.
    pub answers: Tensor,
    /// `[batch]` number of live candidates per sample.
    pub candidate_counts: Tensor,
    /// `[batch, windows, tokens]` CBOW averaging mask.
    pub window_mask: Tensor,
    pub window_size: usize,
    pub num_samples: usize,
    pub token_axis_length: usize,
}

/// Scalar outputs of a forward pass.
#[derive(Debug, Clone)]
pub struct ReaderOutputs {
    /// Scalar loss, differentiable with respect to the trainable variables.
    pub loss: Tensor,
    /// Scalar fraction of samples answered correctly.
    pub accuracy: Tensor,
}

/// The trainable reading-comprehension model, seen from the loop.
pub trait ReaderModel {
    /// Run the model on `feed`. Dropout and similar train-only behaviour
    /// follow `mode`.
    fn forward(&self, feed: &ReaderFeed, mode: StepMode) -> Result<ReaderOutputs>;

    /// Named variables the optimizer updates.
    fn trainable_variables(&self) -> Vec<(String, Var)>;
}

/// Loop state threaded through every step call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopState {
    /// Completed training steps.
    pub global_step: u64,
}

impl LoopState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Result of one step.
#[derive(Debug, Clone)]
pub struct StepReport {
    /// Global step after the call.
    pub step: u64,
    pub loss: f64,
    pub accuracy: f64,
    /// Loss, accuracy and, for training steps, gradient summaries.
    pub summary: Summary,
}

/// Number of non-zero entries in each row of a `[batch, max_entities]`
/// choice tensor.
pub fn candidate_counts(choices: &Tensor) -> Result<Tensor> {
    Ok(choices.ne(0u32)?.to_dtype(DType::U32)?.sum(1)?)
}

/// Rescale `grad` so its L2 norm is at most `max_norm`.
pub fn clip_by_norm(grad: &Tensor, max_norm: f64) -> Result<Tensor> {
    let norm = scalar_value(&grad.sqr()?.sum_all()?)?.sqrt();
    if norm > max_norm {
        Ok((grad * (max_norm / norm))?)
    } else {
        Ok(grad.clone())
    }
}

fn scalar_value(tensor: &Tensor) -> Result<f64> {
    Ok(tensor.to_dtype(DType::F64)?.sum_all()?.to_scalar::<f64>()?)
}

/// Drives a model and its optimizer one batch at a time.
pub struct StepRunner<M, O> {
    model: M,
    optimizer: O,
    answer_index: AnswerIndex,
    clip_norm: f64,
}

impl<M: ReaderModel, O: Optimizer> StepRunner<M, O> {
    /// Create a runner.
    ///
    /// # Arguments
    /// * `model` - The reader to train
    /// * `optimizer` - Optimizer built over the model's trainable variables
    /// * `answer_index` - Raw answer id to slot map
    /// * `clip_norm` - Per-tensor gradient norm ceiling
    pub fn new(model: M, optimizer: O, answer_index: AnswerIndex, clip_norm: f64) -> Self {
        Self {
            model,
            optimizer,
            answer_index,
            clip_norm,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn answer_index(&self) -> &AnswerIndex {
        &self.answer_index
    }

    /// Assemble the reader feed for `batch`.
    pub fn feed(&self, batch: &Batch, mask: &BatchMask) -> Result<ReaderFeed> {
        let num_samples = batch.len();
        if num_samples != mask.batch_size() {
            return Err(YomiteError::ShapeMismatch(format!(
                "batch has {num_samples} samples but the window mask was built for {}",
                mask.batch_size()
            )));
        }
        let token_axis_length = batch.documents.dims()[1];
        if token_axis_length != mask.token_axis_length() {
            return Err(YomiteError::ShapeMismatch(format!(
                "documents have {token_axis_length} tokens but the window mask covers {}",
                mask.token_axis_length()
            )));
        }

        Ok(ReaderFeed {
            documents: batch.documents.clone(),
            questions: batch.questions.clone(),
            answers: self.answer_index.remap(&batch.answers)?,
            candidate_counts: candidate_counts(&batch.choices)?,
            window_mask: mask.tensor().clone(),
            window_size: mask.window_size(),
            num_samples,
            token_axis_length,
        })
    }

    /// Run one step.
    ///
    /// In [`StepMode::Train`] the global step in `state` advances by one
    /// after the optimizer update succeeds; evaluation leaves it untouched.
    pub fn run_step(
        &mut self,
        state: &mut LoopState,
        batch: &Batch,
        mask: &BatchMask,
        mode: StepMode,
    ) -> Result<StepReport> {
        let feed = self.feed(batch, mask)?;
        let outputs = self.model.forward(&feed, mode)?;
        let loss = scalar_value(&outputs.loss)?;
        let accuracy = scalar_value(&outputs.accuracy)?;

        let mut summary = Summary::new();
        summary.scalar("loss", loss);
        summary.scalar("accuracy", accuracy);

        if mode == StepMode::Train {
            self.apply_gradients(&outputs.loss, &mut summary)?;
            state.global_step += 1;
        }

        Ok(StepReport {
            step: state.global_step,
            loss,
            accuracy,
            summary,
        })
    }

    fn apply_gradients(&mut self, loss: &Tensor, summary: &mut Summary) -> Result<()> {
        let mut grads = loss.backward()?;
        for (name, var) in self.model.trainable_variables() {
            let Some(grad) = grads.remove(var.as_tensor()) else {
                tracing::debug!("No gradient for {}, skipping", name);
                continue;
            };
            summary.histogram(format!("{name}/grad/hist"), Histogram::from_tensor(&grad)?);
            summary.scalar(format!("{name}/grad/sparsity"), zero_fraction(&grad)?);
            grads.insert(var.as_tensor(), clip_by_norm(&grad, self.clip_norm)?);
        }
        self.optimizer.step(&grads)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use candle_nn::SGD;

    fn norm(t: &Tensor) -> f64 {
        scalar_value(&t.sqr().unwrap().sum_all().unwrap()).unwrap().sqrt()
    }

    #[test]
    fn clip_rescales_norm_50_to_10() {
        // 3-4-5 triangle scaled to norm 50.
        let grad = Tensor::new(&[30.0f32, 40.0], &Device::Cpu).unwrap();
        let clipped = clip_by_norm(&grad, 10.0).unwrap();
        assert_abs_diff_eq!(norm(&clipped), 10.0, epsilon = 1e-5);
        let values = clipped.to_vec1::<f32>().unwrap();
        assert_abs_diff_eq!(values[0], 6.0, epsilon = 1e-5);
        assert_abs_diff_eq!(values[1], 8.0, epsilon = 1e-5);
    }

    #[test]
    fn clip_leaves_small_gradients_alone() {
        let grad = Tensor::new(&[[0.3f32, 0.4]], &Device::Cpu).unwrap();
        let clipped = clip_by_norm(&grad, 10.0).unwrap();
        assert_eq!(clipped.to_vec2::<f32>().unwrap(), vec![vec![0.3, 0.4]]);
    }

    #[test]
    fn candidate_counts_per_row() {
        let choices = Tensor::new(&[[1u32, 254, 0, 0, 0], [273, 343, 254, 302, 1], [0, 0, 0, 0, 0]], &Device::Cpu)
            .unwrap();
        let counts = candidate_counts(&choices).unwrap();
        assert_eq!(counts.to_vec1::<u32>().unwrap(), vec![2, 5, 0]);
    }

    /// Loss = sum(w * x) where x is the float document tensor; the
    /// gradient of `w` equals the column sums of x.
    struct LinearStub {
        weight: Var,
        unused: Var,
    }

    impl LinearStub {
        fn new() -> Self {
            let dev = Device::Cpu;
            Self {
                weight: Var::zeros(2, DType::F32, &dev).unwrap(),
                unused: Var::zeros(3, DType::F32, &dev).unwrap(),
            }
        }
    }

    impl ReaderModel for LinearStub {
        fn forward(&self, feed: &ReaderFeed, _mode: StepMode) -> Result<ReaderOutputs> {
            let x = feed.documents.to_dtype(DType::F32)?;
            let loss = x.broadcast_mul(self.weight.as_tensor())?.sum_all()?;
            let accuracy = Tensor::new(0.5f32, x.device())?;
            Ok(ReaderOutputs { loss, accuracy })
        }

        fn trainable_variables(&self) -> Vec<(String, Var)> {
            vec![
                ("weight".to_string(), self.weight.clone()),
                ("unused".to_string(), self.unused.clone()),
            ]
        }
    }

    fn batch(documents: &[[u32; 2]; 2]) -> Batch {
        let dev = Device::Cpu;
        Batch {
            epoch: 0,
            index: 0,
            documents: Tensor::new(documents, &dev).unwrap(),
            questions: Tensor::new(&[[1u32], [2]], &dev).unwrap(),
            choices: Tensor::new(&[[1u32, 254], [1, 0]], &dev).unwrap(),
            answers: Tensor::new(&[254u32, 1], &dev).unwrap(),
        }
    }

    fn runner() -> StepRunner<LinearStub, SGD> {
        let model = LinearStub::new();
        let vars: Vec<Var> = model.trainable_variables().into_iter().map(|(_, v)| v).collect();
        let optimizer = SGD::new(vars, 1.0).unwrap();
        let index = AnswerIndex::from_slots([(1, 0), (254, 1)], 2).unwrap();
        StepRunner::new(model, optimizer, index, 10.0)
    }

    fn mask() -> BatchMask {
        let window = crate::window::WindowMask::build(2, 1, crate::config::RaggedWindowPolicy::Reject).unwrap();
        BatchMask::new(&window, 2, &Device::Cpu).unwrap()
    }

    #[test]
    fn feed_binds_every_input() {
        let runner = runner();
        let feed = runner.feed(&batch(&[[1, 2], [3, 4]]), &mask()).unwrap();
        assert_eq!(feed.answers.to_vec1::<u32>().unwrap(), vec![1, 0]);
        assert_eq!(feed.candidate_counts.to_vec1::<u32>().unwrap(), vec![2, 1]);
        assert_eq!(feed.window_mask.dims(), &[2, 2, 2]);
        assert_eq!(feed.window_size, 1);
        assert_eq!(feed.num_samples, 2);
        assert_eq!(feed.token_axis_length, 2);
    }

    #[test]
    fn feed_rejects_mask_of_wrong_batch_size() {
        let runner = runner();
        let window = crate::window::WindowMask::build(2, 1, crate::config::RaggedWindowPolicy::Reject).unwrap();
        let mask = BatchMask::new(&window, 3, &Device::Cpu).unwrap();
        assert!(matches!(
            runner.feed(&batch(&[[1, 2], [3, 4]]), &mask),
            Err(YomiteError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn training_step_clips_each_gradient_and_advances_step() {
        let mut runner = runner();
        let mut state = LoopState::new();

        // Column sums (30, 40): norm 50, clipped to (6, 8); SGD with lr 1.
        let report = runner
            .run_step(&mut state, &batch(&[[10, 20], [20, 20]]), &mask(), StepMode::Train)
            .unwrap();
        assert_eq!(report.step, 1);
        assert_eq!(state.global_step, 1);

        let weight = runner.model().weight.as_tensor().to_vec1::<f32>().unwrap();
        assert_abs_diff_eq!(weight[0], -6.0, epsilon = 1e-4);
        assert_abs_diff_eq!(weight[1], -8.0, epsilon = 1e-4);

        assert!(report.summary.histograms.contains_key("weight/grad/hist"));
        assert!(report.summary.get_scalar("weight/grad/sparsity").is_some());
        assert!(!report.summary.histograms.contains_key("unused/grad/hist"));
        assert_abs_diff_eq!(report.accuracy, 0.5);
    }

    #[test]
    fn evaluation_step_leaves_model_and_counter_alone() {
        let mut runner = runner();
        let mut state = LoopState { global_step: 7 };
        let report = runner
            .run_step(&mut state, &batch(&[[1, 2], [3, 4]]), &mask(), StepMode::Evaluate)
            .unwrap();
        assert_eq!(report.step, 7);
        assert_eq!(state.global_step, 7);
        assert_eq!(runner.model().weight.as_tensor().to_vec1::<f32>().unwrap(), vec![0.0, 0.0]);
        assert!(report.summary.histograms.is_empty());
    }

    #[test]
    fn unknown_answer_aborts_the_step() {
        let mut runner = runner();
        let mut state = LoopState::new();
        let mut bad = batch(&[[1, 2], [3, 4]]);
        bad.answers = Tensor::new(&[254u32, 999], &Device::Cpu).unwrap();
        let err = runner.run_step(&mut state, &bad, &mask(), StepMode::Train).unwrap_err();
        assert!(matches!(err, YomiteError::UnknownAnswerIdentifier { id: 999 }));
        assert_eq!(state.global_step, 0);
    }
}
