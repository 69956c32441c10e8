//! # Dataset Splits
//!
//! A split is four parallel arrays indexed by sample position: document
//! tokens, question tokens, candidate choices and raw gold answer ids.
//! Splits are loaded once from numpy files and never mutated.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};

use crate::data::batch::Batch;
use crate::error::{Result, YomiteError};

/// Parallel `[samples, ...]` arrays for one split (train, val, test).
#[derive(Debug, Clone)]
pub struct DatasetSplit {
    name: String,
    documents: Tensor,
    questions: Tensor,
    choices: Tensor,
    answers: Tensor,
}

impl DatasetSplit {
    /// Assemble a split from in-memory tensors.
    ///
    /// Integer arrays of any dtype are converted to `u32`. Documents,
    /// questions and choices must be 2-D, answers 1-D, and all four must
    /// agree on the sample count.
    pub fn new(
        name: impl Into<String>,
        documents: Tensor,
        questions: Tensor,
        choices: Tensor,
        answers: Tensor,
    ) -> Result<Self> {
        let name = name.into();
        let (samples, _) = documents.dims2().map_err(|_| rank_error(&name, "documents", 2, &documents))?;
        let (q_samples, _) = questions.dims2().map_err(|_| rank_error(&name, "questions", 2, &questions))?;
        let (c_samples, _) = choices.dims2().map_err(|_| rank_error(&name, "choices", 2, &choices))?;
        let a_samples = answers.dims1().map_err(|_| rank_error(&name, "answers", 1, &answers))?;

        if [q_samples, c_samples, a_samples].iter().any(|&n| n != samples) {
            return Err(YomiteError::ShapeMismatch(format!(
                "split {name}: sample counts differ (documents {samples}, questions {q_samples}, \
                 choices {c_samples}, answers {a_samples})"
            )));
        }

        Ok(Self {
            name,
            documents: documents.to_dtype(DType::U32)?,
            questions: questions.to_dtype(DType::U32)?,
            choices: choices.to_dtype(DType::U32)?,
            answers: answers.to_dtype(DType::U32)?,
        })
    }

    /// Load split `name` from `dir`.
    ///
    /// Expects the files `x_{name}_d`, `x_{name}_q`, `y_{name}_choices` and
    /// `y_{name}`, each a numpy array with or without a `.npy` suffix.
    pub fn load<P: AsRef<Path>>(dir: P, name: &str, device: &Device) -> Result<Self> {
        let dir = dir.as_ref();
        tracing::info!("Loading {} split from {}", name, dir.display());

        let documents = read_array(dir, &format!("x_{name}_d"), device)?;
        let questions = read_array(dir, &format!("x_{name}_q"), device)?;
        let choices = read_array(dir, &format!("y_{name}_choices"), device)?;
        let answers = read_array(dir, &format!("y_{name}"), device)?;

        let split = Self::new(name, documents, questions, choices, answers)?;
        tracing::info!(
            "{} D: {:?}, Q: {:?}, choices: {:?}",
            name,
            split.documents.dims(),
            split.questions.dims(),
            split.choices.dims()
        );
        Ok(split)
    }

    /// Keep at most `max_length` token positions of documents and questions.
    pub fn truncate_tokens(self, max_length: usize) -> Result<Self> {
        let documents = narrow_columns(self.documents, max_length)?;
        let questions = narrow_columns(self.questions, max_length)?;
        Ok(Self {
            documents,
            questions,
            ..self
        })
    }

    /// Keep only the first `samples` rows.
    pub fn limit(self, samples: usize) -> Result<Self> {
        if samples >= self.len() {
            return Ok(self);
        }
        self.slice(0, samples)
    }

    /// Rows `[start, start + len)` as a new split.
    pub fn slice(&self, start: usize, len: usize) -> Result<Self> {
        Ok(Self {
            name: self.name.clone(),
            documents: self.documents.narrow(0, start, len)?,
            questions: self.questions.narrow(0, start, len)?,
            choices: self.choices.narrow(0, start, len)?,
            answers: self.answers.narrow(0, start, len)?,
        })
    }

    /// Reorder all four arrays by the same `u32` index tensor.
    pub fn select(&self, indices: &Tensor) -> Result<Self> {
        Ok(Self {
            name: self.name.clone(),
            documents: self.documents.contiguous()?.index_select(indices, 0)?,
            questions: self.questions.contiguous()?.index_select(indices, 0)?,
            choices: self.choices.contiguous()?.index_select(indices, 0)?,
            answers: self.answers.contiguous()?.index_select(indices, 0)?,
        })
    }

    /// The whole split as a single batch.
    pub fn as_batch(&self) -> Batch {
        Batch {
            epoch: 0,
            index: 0,
            documents: self.documents.clone(),
            questions: self.questions.clone(),
            choices: self.choices.clone(),
            answers: self.answers.clone(),
        }
    }

    /// Split name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.answers.dims()[0]
    }

    /// Whether the split holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Document token positions per sample.
    pub fn token_axis_length(&self) -> usize {
        self.documents.dims()[1]
    }

    /// Question token positions per sample.
    pub fn question_length(&self) -> usize {
        self.questions.dims()[1]
    }

    /// Width of the candidate choice vectors.
    pub fn max_entities(&self) -> usize {
        self.choices.dims()[1]
    }

    pub fn documents(&self) -> &Tensor {
        &self.documents
    }

    pub fn questions(&self) -> &Tensor {
        &self.questions
    }

    pub fn choices(&self) -> &Tensor {
        &self.choices
    }

    pub fn answers(&self) -> &Tensor {
        &self.answers
    }

    /// Raw answer ids on the host.
    pub fn answer_ids(&self) -> Result<Vec<u32>> {
        Ok(self.answers.to_vec1::<u32>()?)
    }
}

fn rank_error(split: &str, array: &str, expected: usize, tensor: &Tensor) -> YomiteError {
    YomiteError::ShapeMismatch(format!(
        "split {split}: {array} must be {expected}-D, got shape {:?}",
        tensor.dims()
    ))
}

fn narrow_columns(tensor: Tensor, max_length: usize) -> Result<Tensor> {
    let columns = tensor.dims()[1];
    if max_length >= columns {
        return Ok(tensor);
    }
    Ok(tensor.narrow(1, 0, max_length)?.contiguous()?)
}

fn resolve_array_path(dir: &Path, stem: &str) -> PathBuf {
    let bare = dir.join(stem);
    if bare.exists() {
        bare
    } else {
        dir.join(format!("{stem}.npy"))
    }
}

fn read_array(dir: &Path, stem: &str, device: &Device) -> Result<Tensor> {
    let path = resolve_array_path(dir, stem);
    if !path.exists() {
        return Err(YomiteError::DatasetLoad {
            path,
            reason: "file not found".into(),
        });
    }
    let tensor = Tensor::read_npy(&path).map_err(|e| YomiteError::DatasetLoad {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    Ok(tensor.to_device(device)?)
}
