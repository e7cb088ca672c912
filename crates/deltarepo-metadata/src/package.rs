/// A dependency entry such as `<rpm:entry name="libc.so.6" flags="GE" .../>`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub flags: Option<String>,
    pub epoch: Option<String>,
    pub version: Option<String>,
    pub release: Option<String>,
    pub pre: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PackageFile {
    pub path: String,
    /// `None` for regular files, otherwise `dir` or `ghost`.
    pub file_type: Option<String>,
}

impl PackageFile {
    pub fn new<S: Into<String>>(path: S) -> Self {
        Self {
            path: path.into(),
            file_type: None,
        }
    }

    pub fn dir<S: Into<String>>(path: S) -> Self {
        Self {
            path: path.into(),
            file_type: Some("dir".to_string()),
        }
    }

    /// Whether the file belongs to the subset inlined into primary.xml.
    pub fn is_primary(&self) -> bool {
        self.path.starts_with("/etc/")
            || self.path.contains("bin/")
            || self.path == "/usr/lib/sendmail"
    }

    /// Single character type code used by the filelists database.
    pub fn type_code(&self) -> char {
        match self.file_type.as_deref() {
            Some("dir") => 'd',
            Some("ghost") => 'g',
            _ => 'f',
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Changelog {
    pub author: String,
    pub date: i64,
    pub text: String,
}

/// One package as described by primary.xml, optionally completed with the
/// file list and changelogs from filelists.xml and other.xml.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Package {
    pub pkgid: String,
    pub checksum_type: String,
    pub name: String,
    pub arch: String,
    pub epoch: String,
    pub version: String,
    pub release: String,
    pub summary: String,
    pub description: String,
    pub packager: String,
    pub url: String,
    pub time_file: i64,
    pub time_build: i64,
    pub size_package: u64,
    pub size_installed: u64,
    pub size_archive: u64,
    pub location_href: String,
    pub location_base: Option<String>,
    pub license: String,
    pub vendor: String,
    pub group: String,
    pub buildhost: String,
    pub sourcerpm: String,
    pub header_start: u64,
    pub header_end: u64,
    pub provides: Vec<Dependency>,
    pub requires: Vec<Dependency>,
    pub conflicts: Vec<Dependency>,
    pub obsoletes: Vec<Dependency>,
    pub files: Vec<PackageFile>,
    pub changelogs: Vec<Changelog>,
}

impl Package {
    /// File name component of `location_href`.
    pub fn location_basename(&self) -> &str {
        self.location_href
            .rsplit('/')
            .next()
            .unwrap_or(&self.location_href)
    }

    pub fn nevra(&self) -> String {
        if self.epoch.is_empty() || self.epoch == "0" {
            format!("{}-{}-{}.{}", self.name, self.version, self.release, self.arch)
        } else {
            format!(
                "{}-{}:{}-{}.{}",
                self.name, self.epoch, self.version, self.release, self.arch
            )
        }
    }

    pub fn primary_files(&self) -> impl Iterator<Item = &PackageFile> {
        self.files.iter().filter(|f| f.is_primary())
    }
}
