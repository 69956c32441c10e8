pub mod batch;
pub mod split;
pub mod vocab;

pub use batch::{Batch, BatchIterator};
pub use split::DatasetSplit;
pub use vocab::Vocabulary;
