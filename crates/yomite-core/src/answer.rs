//! # Answer Index
//!
//! Maps raw answer-entity ids from the vocabulary to the fixed output slots
//! of the reader. The map ships as a versioned JSON file next to the
//! vocabulary it was built for and is checked against every split before
//! training starts.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::data::DatasetSplit;
use crate::error::{Result, YomiteError};

/// Format version understood by this build.
pub const ANSWER_INDEX_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct AnswerIndexFile {
    version: u32,
    max_entities: usize,
    slots: BTreeMap<u32, u32>,
}

/// Static, total map from raw entity id to output slot.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerIndex {
    slots: BTreeMap<u32, u32>,
    max_entities: usize,
}

impl AnswerIndex {
    /// Build an index from `(raw_id, slot)` pairs.
    ///
    /// Every slot must be below `max_entities` and no two ids may share one.
    pub fn from_slots<I>(pairs: I, max_entities: usize) -> Result<Self>
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        let mut slots = BTreeMap::new();
        let mut used = HashSet::new();
        for (id, slot) in pairs {
            if slot as usize >= max_entities {
                return Err(YomiteError::InvalidAnswerIndex(format!(
                    "id {id} maps to slot {slot}, outside [0, {max_entities})"
                )));
            }
            if !used.insert(slot) {
                return Err(YomiteError::InvalidAnswerIndex(format!(
                    "slot {slot} is assigned to more than one id"
                )));
            }
            if slots.insert(id, slot).is_some() {
                return Err(YomiteError::InvalidAnswerIndex(format!(
                    "id {id} is listed more than once"
                )));
            }
        }
        if slots.is_empty() {
            return Err(YomiteError::InvalidAnswerIndex("no slots defined".into()));
        }
        Ok(Self {
            slots,
            max_entities,
        })
    }

    /// Read a versioned answer index file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| YomiteError::DatasetLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let file: AnswerIndexFile = serde_json::from_str(&content)?;
        if file.version != ANSWER_INDEX_VERSION {
            return Err(YomiteError::InvalidAnswerIndex(format!(
                "unsupported version {} (expected {ANSWER_INDEX_VERSION})",
                file.version
            )));
        }
        Self::from_slots(file.slots, file.max_entities)
    }

    /// Write the index in the format read by [`AnswerIndex::from_file`].
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = AnswerIndexFile {
            version: ANSWER_INDEX_VERSION,
            max_entities: self.max_entities,
            slots: self.slots.clone(),
        };
        fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    /// Number of output slots of the reader.
    pub fn max_entities(&self) -> usize {
        self.max_entities
    }

    /// Slot for a raw answer id.
    pub fn to_slot_index(&self, raw_id: u32) -> Result<u32> {
        self.slots
            .get(&raw_id)
            .copied()
            .ok_or(YomiteError::UnknownAnswerIdentifier { id: raw_id })
    }

    /// Map a 1-D tensor of raw ids to a `u32` tensor of slots on the same device.
    pub fn remap(&self, raw_ids: &Tensor) -> Result<Tensor> {
        let slots = raw_ids
            .to_vec1::<u32>()?
            .into_iter()
            .map(|id| self.to_slot_index(id))
            .collect::<Result<Vec<u32>>>()?;
        let len = slots.len();
        Ok(Tensor::from_vec(slots, len, raw_ids.device())?)
    }

    /// Check that every answer id in `split` resolves and that its choice
    /// vectors fit in the reader's slots.
    pub fn validate_split(&self, split: &DatasetSplit) -> Result<()> {
        if split.max_entities() > self.max_entities {
            return Err(YomiteError::ShapeMismatch(format!(
                "split {}: choice vectors have {} entries but the answer index has {} slots",
                split.name(),
                split.max_entities(),
                self.max_entities
            )));
        }
        for id in split.answer_ids()? {
            self.to_slot_index(id)?;
        }
        tracing::debug!("All {} answers of split {} resolve", split.len(), split.name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn vocab_50k() -> AnswerIndex {
        AnswerIndex::from_slots([(1, 0), (273, 2), (343, 4), (254, 1), (302, 3)], 5).unwrap()
    }

    #[test]
    fn known_ids_map_to_their_slots() {
        let index = vocab_50k();
        assert_eq!(index.to_slot_index(1).unwrap(), 0);
        assert_eq!(index.to_slot_index(254).unwrap(), 1);
        assert_eq!(index.to_slot_index(273).unwrap(), 2);
        assert_eq!(index.to_slot_index(302).unwrap(), 3);
        assert_eq!(index.to_slot_index(343).unwrap(), 4);
    }

    #[test]
    fn unknown_id_fails_instead_of_defaulting() {
        let err = vocab_50k().to_slot_index(204).unwrap_err();
        assert!(matches!(err, YomiteError::UnknownAnswerIdentifier { id: 204 }));
    }

    #[test]
    fn remap_tensor() {
        let ids = Tensor::new(&[343u32, 1, 254], &Device::Cpu).unwrap();
        let slots = vocab_50k().remap(&ids).unwrap();
        assert_eq!(slots.to_vec1::<u32>().unwrap(), vec![4, 0, 1]);

        let bad = Tensor::new(&[343u32, 7], &Device::Cpu).unwrap();
        assert!(vocab_50k().remap(&bad).is_err());
    }

    #[test]
    fn ambiguous_maps_are_rejected() {
        assert!(AnswerIndex::from_slots([(1, 0), (2, 0)], 5).is_err());
        assert!(AnswerIndex::from_slots([(1, 0), (1, 1)], 5).is_err());
        assert!(AnswerIndex::from_slots([(1, 5)], 5).is_err());
        assert!(AnswerIndex::from_slots(Vec::<(u32, u32)>::new(), 5).is_err());
    }

    #[test]
    fn file_round_trip_and_version_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("answer_index.json");
        vocab_50k().save(&path).unwrap();
        assert_eq!(AnswerIndex::from_file(&path).unwrap(), vocab_50k());

        std::fs::write(&path, r#"{"version": 2, "max_entities": 5, "slots": {"1": 0}}"#).unwrap();
        assert!(matches!(
            AnswerIndex::from_file(&path),
            Err(YomiteError::InvalidAnswerIndex(_))
        ));
    }

    #[test]
    fn validate_split_catches_unknown_answers() {
        let dev = Device::Cpu;
        let split = DatasetSplit::new(
            "val",
            Tensor::zeros((2, 4), candle_core::DType::U32, &dev).unwrap(),
            Tensor::zeros((2, 2), candle_core::DType::U32, &dev).unwrap(),
            Tensor::zeros((2, 5), candle_core::DType::U32, &dev).unwrap(),
            Tensor::new(&[1u32, 99], &dev).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            vocab_50k().validate_split(&split),
            Err(YomiteError::UnknownAnswerIdentifier { id: 99 })
        ));
    }
}
