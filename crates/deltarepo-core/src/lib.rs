use error::DeltaRepoError;

pub mod applicator;
pub mod constants;
pub mod deltametadata;
pub mod error;
pub mod generator;
pub mod graph;
pub mod identity;
pub mod index;
pub mod plugins;
pub mod removed;
pub mod repo;
pub mod updater;
pub mod utils;

#[cfg(test)]
mod test_utils;

pub type DeltaRepoResult<T> = std::result::Result<T, DeltaRepoError>;
