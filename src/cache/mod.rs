mod disk;
mod key;
mod prune;

pub use disk::{CacheEntry, CacheError, DiskCache};
pub use key::{cache_key, CacheKeyParams};
pub use prune::{prune_to_size, pruner_fairing, PruneReport};
