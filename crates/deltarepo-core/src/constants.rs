//! Names shared by the generator, the applicator and the index tooling.

use deltarepo_utils::hash::ChecksumType;

pub const PRIMARY: &str = "primary";
pub const FILELISTS: &str = "filelists";
pub const OTHER: &str = "other";
pub const GROUP: &str = "group";
pub const GROUP_GZ: &str = "group_gz";

/// Record type of the notes file inside a delta repository.
pub const DELTAMETADATA: &str = "deltametadata";

/// Record type of the removed-set file inside a delta repository.
pub const REMOVED: &str = "removed";

pub const DELTAMETADATA_FILENAME: &str = "deltametadata.xml";
pub const REMOVED_FILENAME: &str = "removed.xml";

/// Prefix of the scratch directory a generator or applicator writes into.
pub const SCRATCH_PREFIX: &str = ".repodata.tmp";

/// Checksum recorded for `repomd.xml` in the delta index.
pub const INDEX_REPOMD_CHECKSUM: ChecksumType = ChecksumType::Sha256;

/// Prefix of the working directory an update fetches and applies deltas in.
pub const UPDATE_PREFIX: &str = ".deltarepo-update";
