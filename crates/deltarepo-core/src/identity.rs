//! Package identity and repository content hashes.
//!
//! A repository's content hash only depends on which packages it carries and
//! where they live, never on the order they appear in `primary.xml`.

use std::{cmp::Ordering, path::Path};

use deltarepo_metadata::{primary::PrimaryReader, Package};
use deltarepo_utils::hash::{ChecksumType, Hasher};
use tracing::warn;

use crate::DeltaRepoResult;

/// `(pkgid, location_href, location_base)`. Moving a package counts as a
/// removal plus an addition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageIdentity {
    pub pkgid: String,
    pub location_href: String,
    pub location_base: Option<String>,
}

impl PackageIdentity {
    pub fn of(pkg: &Package) -> Self {
        Self {
            pkgid: pkg.pkgid.clone(),
            location_href: pkg.location_href.clone(),
            location_base: pkg.location_base.clone(),
        }
    }
}

/// The string a package contributes to the content hash.
pub fn contenthash_input(pkg: &Package) -> String {
    if pkg.pkgid.is_empty() {
        warn!("Missing pkgId in package {}", pkg.name);
    }
    if pkg.location_href.is_empty() {
        warn!("Missing location_href at package {} {}", pkg.name, pkg.pkgid);
    }
    format!(
        "{}{}{}",
        pkg.pkgid,
        pkg.location_href,
        pkg.location_base.as_deref().unwrap_or_default()
    )
}

/// Accumulates content hash inputs in any order.
#[derive(Debug, Clone)]
pub struct ContentHasher {
    checksum_type: ChecksumType,
    inputs: Vec<String>,
}

impl ContentHasher {
    pub fn new(checksum_type: ChecksumType) -> Self {
        Self {
            checksum_type,
            inputs: Vec::new(),
        }
    }

    pub fn add(&mut self, pkg: &Package) {
        self.inputs.push(contenthash_input(pkg));
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn finish(mut self) -> String {
        self.inputs.sort_unstable();
        let mut hasher = Hasher::new(self.checksum_type);
        for input in &self.inputs {
            hasher.update(input.as_bytes());
        }
        hasher.finalize_hex()
    }
}

/// Content hash of an unordered set of packages.
pub fn compute_content_hash<'a, I>(packages: I, checksum_type: ChecksumType) -> String
where
    I: IntoIterator<Item = &'a Package>,
{
    let mut hasher = ContentHasher::new(checksum_type);
    for pkg in packages {
        hasher.add(pkg);
    }
    hasher.finish()
}

/// Content hash of the packages listed in a primary metadata file.
pub fn content_hash_of_primary<P: AsRef<Path>>(
    path: P,
    checksum_type: ChecksumType,
) -> DeltaRepoResult<String> {
    let mut hasher = ContentHasher::new(checksum_type);
    for pkg in PrimaryReader::open(path)?.with_files(false) {
        hasher.add(&pkg?);
    }
    Ok(hasher.finish())
}

/// Output order of written metadata: file name first, then the full href.
pub fn package_order(a: &Package, b: &Package) -> Ordering {
    a.location_basename()
        .cmp(b.location_basename())
        .then_with(|| a.location_href.cmp(&b.location_href))
}

pub fn sort_packages(packages: &mut [Package]) {
    packages.sort_by(package_order);
}
