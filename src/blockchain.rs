// Thin re-export module: the block type, the admission rules and the
// ledger engine live in `blockchain/`.

pub mod block;
pub mod ledger;
pub mod validation;

pub use block::{Block, GENESIS_PREVIOUS_HASH};
pub use ledger::{Blockchain, Replacement};
pub use validation::{DifficultyPolicy, TrivialDifficulty, Validator};
