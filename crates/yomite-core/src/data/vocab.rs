//! Vocabulary built alongside the pre-indexed datasets.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, YomiteError};

/// Token list whose positions are the ids used in the dataset arrays.
/// Id 0 is padding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vocabulary {
    tokens: Vec<String>,
    #[serde(skip)]
    index: HashMap<String, u32>,
}

impl Vocabulary {
    /// Build a vocabulary from tokens in id order.
    pub fn new(tokens: Vec<String>) -> Self {
        let index = tokens
            .iter()
            .enumerate()
            .map(|(id, token)| (token.clone(), id as u32))
            .collect();
        Self { tokens, index }
    }

    /// Read a vocabulary written by [`Vocabulary::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| YomiteError::DatasetLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let parsed: Vocabulary = serde_json::from_str(&content)?;
        Ok(Self::new(parsed.tokens))
    }

    /// Write the vocabulary as JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    /// Number of ids, padding included.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Token for an id.
    pub fn token(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    /// Id for a token.
    pub fn id(&self, token: &str) -> Option<u32> {
        self.index.get(token).copied()
    }
}
