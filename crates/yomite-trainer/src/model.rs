//! CBOW windowed Stanford Reader.
//!
//! Document embeddings are averaged per window through the batch mask,
//! the question is a bag-of-words average projected into a query, and a
//! bilinear attention over windows feeds a small classifier over the
//! entity slots. Slots past a sample's candidate count are masked out.

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{Embedding, Linear, Module, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use yomite_core::{ReaderFeed, ReaderModel, ReaderOutputs, Result, StepMode, YomiteError};

/// Score given to masked-out entity slots.
const MASKED_LOGIT: f32 = -1e9;

/// Model hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Ids in the vocabulary, padding included.
    pub vocab_size: usize,
    pub embedding_dim: usize,
    /// Width of the fully connected layer before the output.
    pub hidden_units: usize,
    /// Number of entity slots.
    pub max_entities: usize,
    pub dropout_keep_prob: f32,
    /// Weight of the L2 penalty on all trainable variables.
    pub l2_reg_lambda: f64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            vocab_size: 0,
            embedding_dim: 100,
            hidden_units: 16,
            max_entities: 5,
            dropout_keep_prob: 0.5,
            l2_reg_lambda: 0.0,
        }
    }
}

impl ReaderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.embedding_dim == 0 || self.hidden_units == 0 {
            return Err(YomiteError::InvalidConfig(
                "vocab_size, embedding_dim and hidden_units must be positive".into(),
            ));
        }
        if self.max_entities == 0 {
            return Err(YomiteError::InvalidConfig("max_entities must be positive".into()));
        }
        if !(self.dropout_keep_prob > 0.0 && self.dropout_keep_prob <= 1.0) {
            return Err(YomiteError::InvalidConfig(format!(
                "dropout_keep_prob must be in (0, 1], got {}",
                self.dropout_keep_prob
            )));
        }
        if self.l2_reg_lambda < 0.0 {
            return Err(YomiteError::InvalidConfig("l2_reg_lambda must not be negative".into()));
        }
        Ok(())
    }
}

pub struct StanfordReader {
    config: ReaderConfig,
    varmap: VarMap,
    embedding: Embedding,
    question_proj: Linear,
    hidden: Linear,
    output: Linear,
}

impl StanfordReader {
    /// Create the reader with its variables registered in `varmap`.
    pub fn new(config: ReaderConfig, varmap: &VarMap, device: &Device) -> Result<Self> {
        config.validate()?;
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);

        let embedding = candle_nn::embedding(config.vocab_size, config.embedding_dim, vb.pp("embedding"))?;
        let question_proj =
            candle_nn::linear(config.embedding_dim, config.embedding_dim, vb.pp("question_proj"))?;
        let hidden = candle_nn::linear(config.embedding_dim, config.hidden_units, vb.pp("hidden"))?;
        let output = candle_nn::linear(config.hidden_units, config.max_entities, vb.pp("output"))?;

        Ok(Self {
            config,
            varmap: varmap.clone(),
            embedding,
            question_proj,
            hidden,
            output,
        })
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    fn check_feed(&self, feed: &ReaderFeed) -> Result<()> {
        let mask = feed.window_mask.dims();
        if mask.len() != 3 || mask[0] != feed.num_samples || mask[2] != feed.token_axis_length {
            return Err(YomiteError::ShapeMismatch(format!(
                "window mask {:?} does not match {} samples of {} tokens",
                mask, feed.num_samples, feed.token_axis_length
            )));
        }
        if mask[1] * feed.window_size > feed.token_axis_length {
            return Err(YomiteError::ShapeMismatch(format!(
                "{} windows of size {} exceed {} tokens",
                mask[1], feed.window_size, feed.token_axis_length
            )));
        }
        Ok(())
    }

    /// Bag-of-words average of the non-padding question tokens: `[batch, dim]`.
    fn encode_question(&self, questions: &Tensor) -> Result<Tensor> {
        let embedded = self.embedding.forward(questions)?;
        let present = questions.ne(0u32)?.to_dtype(DType::F32)?;
        let summed = embedded.broadcast_mul(&present.unsqueeze(2)?)?.sum(1)?;
        let lengths = present.sum_keepdim(1)?.maximum(1f32)?;
        Ok(summed.broadcast_div(&lengths)?)
    }

    /// Entity slot scores: `[batch, max_entities]`, masked past each
    /// sample's candidate count.
    fn logits(&self, feed: &ReaderFeed, mode: StepMode) -> Result<Tensor> {
        let documents = self.embedding.forward(&feed.documents)?;
        let windows = feed.window_mask.matmul(&documents)?;

        let query = self
            .question_proj
            .forward(&self.encode_question(&feed.questions)?)?;
        let scores = windows.matmul(&query.unsqueeze(2)?)?.squeeze(2)?;
        let attention = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let context = attention.unsqueeze(1)?.matmul(&windows)?.squeeze(1)?;

        let mut hidden = self.hidden.forward(&context)?.relu()?;
        if mode == StepMode::Train && self.config.dropout_keep_prob < 1.0 {
            hidden = candle_nn::ops::dropout(&hidden, 1.0 - self.config.dropout_keep_prob)?;
        }
        let logits = self.output.forward(&hidden)?;

        let device = logits.device();
        let slots = Tensor::arange(0u32, self.config.max_entities as u32, device)?.unsqueeze(0)?;
        let live = slots.broadcast_lt(&feed.candidate_counts.unsqueeze(1)?)?;
        let floor = logits.zeros_like()?.affine(0.0, MASKED_LOGIT as f64)?;
        Ok(live.where_cond(&logits, &floor)?)
    }

    fn l2_penalty(&self, device: &Device) -> Result<Tensor> {
        let mut total = Tensor::zeros((), DType::F32, device)?;
        for (_, var) in self.trainable_variables() {
            total = total.add(&var.as_tensor().sqr()?.sum_all()?)?;
        }
        Ok(total.affine(self.config.l2_reg_lambda, 0.0)?)
    }
}

impl ReaderModel for StanfordReader {
    fn forward(&self, feed: &ReaderFeed, mode: StepMode) -> Result<ReaderOutputs> {
        self.check_feed(feed)?;
        let logits = self.logits(feed, mode)?;

        let mut loss = candle_nn::loss::cross_entropy(&logits, &feed.answers)?;
        if self.config.l2_reg_lambda > 0.0 {
            loss = loss.add(&self.l2_penalty(logits.device())?)?;
        }

        let predictions = logits.argmax(D::Minus1)?;
        let accuracy = predictions
            .eq(&feed.answers)?
            .to_dtype(DType::F32)?
            .mean_all()?;

        Ok(ReaderOutputs { loss, accuracy })
    }

    fn trainable_variables(&self) -> Vec<(String, Var)> {
        let data = match self.varmap.data().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }
}
