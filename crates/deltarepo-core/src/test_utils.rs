//! Small repositories written to disk for tests.

use std::{fs, path::Path};

use deltarepo_metadata::{
    filelists::FilelistsWriter,
    other::OtherWriter,
    primary::PrimaryWriter,
    sqlite::{build_database, DbKind},
    Changelog, Dependency, Package, PackageFile, Repomd, RepomdRecord, REPODATA_DIR,
};
use deltarepo_utils::{
    compression::{compress_file, CompressionType},
    hash::ChecksumType,
};

use crate::utils::repomd_path;

pub fn package(pkgid: &str, name: &str) -> Package {
    Package {
        pkgid: pkgid.to_string(),
        checksum_type: "sha256".to_string(),
        name: name.to_string(),
        arch: "x86_64".to_string(),
        epoch: "0".to_string(),
        version: "1.0".to_string(),
        release: "1".to_string(),
        summary: format!("The {name} package"),
        description: format!("{name} does things."),
        url: format!("https://example.com/{name}"),
        time_file: 1_700_000_000,
        time_build: 1_699_999_000,
        size_package: 1024,
        size_installed: 4096,
        size_archive: 4200,
        location_href: format!("{name}.rpm"),
        license: "MIT".to_string(),
        sourcerpm: format!("{name}-1.0-1.src.rpm"),
        header_start: 4504,
        header_end: 5800,
        provides: vec![Dependency {
            name: name.to_string(),
            flags: Some("EQ".to_string()),
            epoch: Some("0".to_string()),
            version: Some("1.0".to_string()),
            release: Some("1".to_string()),
            pre: false,
        }],
        requires: vec![Dependency {
            name: "libc.so.6()(64bit)".to_string(),
            ..Default::default()
        }],
        files: vec![
            PackageFile::new(format!("/usr/bin/{name}")),
            PackageFile::dir(format!("/usr/share/doc/{name}")),
            PackageFile::new(format!("/usr/share/doc/{name}/README")),
        ],
        changelogs: vec![Changelog {
            author: "Packager <packager@example.com> - 1.0-1".to_string(),
            date: 1_690_000_000,
            text: format!("- Initial {name} package"),
        }],
        ..Default::default()
    }
}

pub struct RepoFixture<'a> {
    pub packages: &'a [Package],
    pub revision: Option<String>,
    /// Written as a sha256 `contenthash` into repomd.xml.
    pub contenthash: Option<String>,
    pub unique_md_filenames: bool,
    pub databases: bool,
    pub group: Option<&'a str>,
    /// Comps written gzip-compressed as `group_gz`.
    pub group_gz: Option<&'a str>,
    pub compression: CompressionType,
}

impl<'a> RepoFixture<'a> {
    pub fn new(packages: &'a [Package]) -> Self {
        Self {
            packages,
            revision: Some("1".to_string()),
            contenthash: None,
            unique_md_filenames: false,
            databases: false,
            group: None,
            group_gz: None,
            compression: CompressionType::Gz,
        }
    }
}

/// Writes a complete repository under `root` and returns its repomd.
pub fn write_repo(root: &Path, fixture: &RepoFixture<'_>) -> Repomd {
    let repodata = root.join(REPODATA_DIR);
    fs::create_dir_all(&repodata).unwrap();

    let mut repomd = Repomd {
        revision: fixture.revision.clone(),
        ..Default::default()
    };
    if let Some(hash) = &fixture.contenthash {
        repomd.set_contenthash(hash.clone(), ChecksumType::Sha256);
    }

    for kind in ["primary", "filelists", "other"] {
        let path = repodata.join(format!("{kind}.xml{}", fixture.compression.suffix()));
        write_metadata(kind, &path, fixture);

        let mut record = RepomdRecord::new(kind, &path);
        record.fill(ChecksumType::Sha256).unwrap();

        if fixture.databases {
            let db_kind = DbKind::from_metadata_kind(kind).unwrap();
            let mut db_record = build_database(
                db_kind,
                &repodata,
                fixture.packages,
                &record,
                CompressionType::Xz,
                ChecksumType::Sha256,
            )
            .unwrap();
            if fixture.unique_md_filenames {
                db_record.rename_file().unwrap();
            }
            repomd.set_record(db_record);
        }

        if fixture.unique_md_filenames {
            record.rename_file().unwrap();
        }
        repomd.set_record(record);
    }

    if let Some(group) = fixture.group {
        let path = repodata.join("comps.xml");
        fs::write(&path, group).unwrap();
        let mut record = RepomdRecord::new("group", &path);
        record.fill(ChecksumType::Sha256).unwrap();
        if fixture.unique_md_filenames {
            record.rename_file().unwrap();
        }
        repomd.set_record(record);
    }

    if let Some(group) = fixture.group_gz {
        let plain = root.join("comps-gz-source.xml");
        fs::write(&plain, group).unwrap();
        let path = repodata.join("comps.xml.gz");
        compress_file(&plain, &path, CompressionType::Gz).unwrap();
        fs::remove_file(&plain).unwrap();

        let mut record = RepomdRecord::new("group_gz", &path);
        record.fill(ChecksumType::Sha256).unwrap();
        if fixture.unique_md_filenames {
            record.rename_file().unwrap();
        }
        repomd.set_record(record);
    }

    repomd.write_file(repomd_path(root)).unwrap();
    repomd
}

fn write_metadata(kind: &str, path: &Path, fixture: &RepoFixture<'_>) {
    let count = fixture.packages.len();
    match kind {
        "primary" => {
            let mut writer = PrimaryWriter::create(path, fixture.compression, count).unwrap();
            for pkg in fixture.packages {
                writer.add_package(pkg).unwrap();
            }
            writer.finish().unwrap();
        }
        "filelists" => {
            let mut writer = FilelistsWriter::create(path, fixture.compression, count).unwrap();
            for pkg in fixture.packages {
                writer.add_package(pkg).unwrap();
            }
            writer.finish().unwrap();
        }
        _ => {
            let mut writer = OtherWriter::create(path, fixture.compression, count).unwrap();
            for pkg in fixture.packages {
                writer.add_package(pkg).unwrap();
            }
            writer.finish().unwrap();
        }
    }
}

pub const COMPS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<comps>
  <group>
    <id>core</id>
    <name>Core</name>
    <packagelist>
      <packagereq type="mandatory">p1</packagereq>
    </packagelist>
  </group>
</comps>
"#;
