use std::{
    fs,
    io::BufRead,
    path::{Path, PathBuf},
    str::FromStr,
    sync::LazyLock,
    time::UNIX_EPOCH,
};

use deltarepo_utils::{
    compression::{open_reader, CompressionType},
    hash::{calculate_checksum, checksum_reader, ChecksumType},
    path::file_name_of,
};
use regex::Regex;
use tracing::debug;

use crate::{
    error::{IoContext, MetadataError, MetadataResult},
    xml::{render, write_by_suffix, Node, XmlSink, XmlSource},
    REPODATA_DIR, XML_REPO_NS, XML_RPM_NS,
};

static CHECKSUM_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{32,128}-").expect("unable to compile checksum prefix regex")
});

/// Whether a file name follows the unique-md-filenames convention.
pub fn has_checksum_prefix(name: &str) -> bool {
    CHECKSUM_PREFIX_RE.is_match(name)
}

/// File name without its leading checksum, e.g. `primary.xml.gz`.
pub fn strip_checksum_prefix(name: &str) -> &str {
    match CHECKSUM_PREFIX_RE.find(name) {
        Some(m) => &name[m.end()..],
        None => name,
    }
}

/// A `<data>` entry of repomd.xml.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepomdRecord {
    pub kind: String,
    pub location_href: String,
    pub location_base: Option<String>,
    pub checksum: String,
    pub checksum_type: String,
    pub open_checksum: Option<String>,
    pub open_checksum_type: Option<String>,
    pub timestamp: i64,
    pub size: u64,
    pub open_size: Option<u64>,
    pub database_version: Option<u32>,
    /// Where the file lives on disk. Never serialized.
    pub location_real: Option<PathBuf>,
}

impl RepomdRecord {
    /// Creates a record for a file placed in a `repodata` directory.
    pub fn new<S: Into<String>, P: AsRef<Path>>(kind: S, path: P) -> Self {
        let path = path.as_ref();
        Self {
            kind: kind.into(),
            location_href: format!("{REPODATA_DIR}/{}", file_name_of(path)),
            location_real: Some(path.to_path_buf()),
            ..Default::default()
        }
    }

    pub fn file_name(&self) -> &str {
        self.location_href
            .rsplit('/')
            .next()
            .unwrap_or(&self.location_href)
    }

    pub fn path_in<P: AsRef<Path>>(&self, repo_root: P) -> PathBuf {
        repo_root.as_ref().join(&self.location_href)
    }

    pub fn real_path(&self) -> MetadataResult<&Path> {
        self.location_real
            .as_deref()
            .ok_or_else(|| MetadataError::NotFound(PathBuf::from(&self.location_href)))
    }

    pub fn exists(&self) -> bool {
        self.location_real.as_deref().is_some_and(Path::is_file)
    }

    pub fn checksum_type(&self) -> MetadataResult<ChecksumType> {
        ChecksumType::from_str(&self.checksum_type).map_err(MetadataError::from)
    }

    /// Computes size, checksum and timestamp of the file, plus the open
    /// (decompressed) size and checksum when it is compressed.
    pub fn fill(&mut self, checksum_type: ChecksumType) -> MetadataResult<()> {
        let path = self.real_path()?.to_path_buf();
        let meta = fs::metadata(&path)
            .io_context(|| format!("read metadata of {}", path.display()))?;

        self.size = meta.len();
        self.timestamp = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.checksum = calculate_checksum(&path, checksum_type)?;
        self.checksum_type = checksum_type.name().to_string();

        match CompressionType::detect_file(&path)? {
            CompressionType::None | CompressionType::Bz2 => {
                self.open_checksum = None;
                self.open_checksum_type = None;
                self.open_size = None;
            }
            _ => {
                let reader = open_reader(&path)?;
                let (digest, size) = checksum_reader(reader, checksum_type)
                    .io_context(|| format!("decompress {}", path.display()))?;
                self.open_checksum = Some(digest);
                self.open_checksum_type = Some(checksum_type.name().to_string());
                self.open_size = Some(size);
            }
        }
        Ok(())
    }

    /// Renames the file to `<checksum>-<name>`, replacing an older prefix.
    pub fn rename_file(&mut self) -> MetadataResult<()> {
        let path = self.real_path()?.to_path_buf();
        let name = file_name_of(&path);
        let new_name = format!("{}-{}", self.checksum, strip_checksum_prefix(&name));
        if new_name == name {
            return Ok(());
        }

        let new_path = path.with_file_name(&new_name);
        fs::rename(&path, &new_path).io_context(|| {
            format!("rename {} to {}", path.display(), new_path.display())
        })?;
        debug!("renamed {} to {}", name, new_name);

        self.location_href = match self.location_href.rsplit_once('/') {
            Some((dir, _)) => format!("{dir}/{new_name}"),
            None => new_name,
        };
        self.location_real = Some(new_path);
        Ok(())
    }

    fn write<W: std::io::Write>(&self, sink: &mut XmlSink<W>) -> MetadataResult<()> {
        sink.start("data", &[("type", &self.kind)])?;
        sink.text_element("checksum", &[("type", &self.checksum_type)], &self.checksum)?;
        if let Some(open_checksum) = &self.open_checksum {
            let open_type = self
                .open_checksum_type
                .as_deref()
                .unwrap_or(&self.checksum_type);
            sink.text_element("open-checksum", &[("type", open_type)], open_checksum)?;
        }
        match &self.location_base {
            Some(base) => {
                sink.empty("location", &[("xml:base", base), ("href", &self.location_href)])?
            }
            None => sink.empty("location", &[("href", &self.location_href)])?,
        }
        sink.text_element("timestamp", &[], &self.timestamp.to_string())?;
        sink.text_element("size", &[], &self.size.to_string())?;
        if let Some(open_size) = self.open_size {
            sink.text_element("open-size", &[], &open_size.to_string())?;
        }
        if let Some(version) = self.database_version {
            sink.text_element("database_version", &[], &version.to_string())?;
        }
        sink.end("data")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DistroTag {
    pub cpeid: Option<String>,
    pub name: String,
}

/// The parsed `repodata/repomd.xml` descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Repomd {
    pub revision: Option<String>,
    pub contenthash: Option<String>,
    pub contenthash_type: Option<String>,
    pub repo_tags: Vec<String>,
    pub content_tags: Vec<String>,
    pub distro_tags: Vec<DistroTag>,
    pub records: Vec<RepomdRecord>,
}

fn parse_text<T: FromStr>(element: &str, text: &str) -> MetadataResult<T> {
    text.trim().parse().map_err(|_| {
        MetadataError::InvalidValue {
            element: element.to_string(),
            value: text.to_string(),
        }
    })
}

impl Repomd {
    /// Parses `repomd.xml`, resolving record paths against the repository
    /// root (the parent of the `repodata` directory).
    pub fn parse_file<P: AsRef<Path>>(path: P) -> MetadataResult<Self> {
        let path = path.as_ref();
        let repo_root = path.parent().and_then(Path::parent);
        Self::parse_source(XmlSource::open(path)?, repo_root)
    }

    pub fn parse_source<R: BufRead>(
        mut source: XmlSource<R>,
        repo_root: Option<&Path>,
    ) -> MetadataResult<Self> {
        let mut repomd = Repomd::default();
        let (_, has_content) = source.expect_root("repomd")?;
        if !has_content {
            return Ok(repomd);
        }

        loop {
            match source.next_node()? {
                Node::Start(e) => {
                    match e.name.as_str() {
                        "revision" => repomd.revision = Some(source.read_text("revision")?),
                        "contenthash" => {
                            repomd.contenthash_type = e.attr_string("type");
                            repomd.contenthash = Some(source.read_text("contenthash")?);
                        }
                        "tags" => repomd.read_tags(&mut source)?,
                        "data" => {
                            let mut record = read_record(&mut source, e.required_attr("type")?)?;
                            record.location_real =
                                repo_root.map(|root| root.join(&record.location_href));
                            repomd.records.push(record);
                        }
                        other => source.skip_element(other)?,
                    }
                }
                Node::End(_) | Node::Eof => break,
                _ => {}
            }
        }
        Ok(repomd)
    }

    fn read_tags<R: BufRead>(&mut self, source: &mut XmlSource<R>) -> MetadataResult<()> {
        loop {
            match source.next_node()? {
                Node::Start(e) => {
                    let text = source.read_text(&e.name)?;
                    match e.name.as_str() {
                        "repo" => self.repo_tags.push(text),
                        "content" => self.content_tags.push(text),
                        "distro" => {
                            self.distro_tags.push(DistroTag {
                                cpeid: e.attr_string("cpeid"),
                                name: text,
                            })
                        }
                        _ => {}
                    }
                }
                Node::End(_) => return Ok(()),
                Node::Eof => {
                    return Err(MetadataError::UnexpectedEof {
                        element: "tags".to_string(),
                    })
                }
                _ => {}
            }
        }
    }

    pub fn record(&self, kind: &str) -> Option<&RepomdRecord> {
        self.records.iter().find(|r| r.kind == kind)
    }

    /// Adds a record, replacing any existing record of the same type.
    pub fn set_record(&mut self, record: RepomdRecord) {
        match self.records.iter_mut().find(|r| r.kind == record.kind) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
    }

    pub fn remove_record(&mut self, kind: &str) -> Option<RepomdRecord> {
        let idx = self.records.iter().position(|r| r.kind == kind)?;
        Some(self.records.remove(idx))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.kind.as_str())
    }

    pub fn set_contenthash<S: Into<String>>(&mut self, hash: S, hash_type: ChecksumType) {
        self.contenthash = Some(hash.into());
        self.contenthash_type = Some(hash_type.name().to_string());
    }

    /// Latest timestamp of all records.
    pub fn max_timestamp(&self) -> i64 {
        self.records.iter().map(|r| r.timestamp).max().unwrap_or(0)
    }

    /// Serializes the descriptor with records sorted by type.
    pub fn to_xml(&self) -> MetadataResult<Vec<u8>> {
        let mut records: Vec<&RepomdRecord> = self.records.iter().collect();
        records.sort_by(|a, b| a.kind.cmp(&b.kind));

        render(|sink| {
            sink.start("repomd", &[("xmlns", XML_REPO_NS), ("xmlns:rpm", XML_RPM_NS)])?;
            if let Some(revision) = &self.revision {
                sink.text_element("revision", &[], revision)?;
            }
            if let Some(contenthash) = &self.contenthash {
                let hash_type = self.contenthash_type.as_deref().unwrap_or_default();
                sink.text_element("contenthash", &[("type", hash_type)], contenthash)?;
            }
            if !self.repo_tags.is_empty()
                || !self.content_tags.is_empty()
                || !self.distro_tags.is_empty()
            {
                sink.start("tags", &[])?;
                for tag in &self.content_tags {
                    sink.text_element("content", &[], tag)?;
                }
                for tag in &self.repo_tags {
                    sink.text_element("repo", &[], tag)?;
                }
                for tag in &self.distro_tags {
                    match &tag.cpeid {
                        Some(cpeid) => sink.text_element("distro", &[("cpeid", cpeid)], &tag.name)?,
                        None => sink.text_element("distro", &[], &tag.name)?,
                    }
                }
                sink.end("tags")?;
            }
            for record in records {
                record.write(sink)?;
            }
            sink.end("repomd")
        })
    }

    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> MetadataResult<()> {
        write_by_suffix(path, &self.to_xml()?)
    }
}

fn read_record<R: BufRead>(source: &mut XmlSource<R>, kind: &str) -> MetadataResult<RepomdRecord> {
    let mut record = RepomdRecord {
        kind: kind.to_string(),
        ..Default::default()
    };
    loop {
        match source.next_node()? {
            Node::Start(e) => {
                let text = source.read_text(&e.name)?;
                match e.name.as_str() {
                    "checksum" => {
                        record.checksum_type = e.attr_string("type").unwrap_or_default();
                        record.checksum = text;
                    }
                    "open-checksum" => {
                        record.open_checksum_type = e.attr_string("type");
                        record.open_checksum = Some(text);
                    }
                    "timestamp" => record.timestamp = parse_text("timestamp", &text)?,
                    "size" => record.size = parse_text("size", &text)?,
                    "open-size" => record.open_size = Some(parse_text("open-size", &text)?),
                    "database_version" => {
                        record.database_version = Some(parse_text("database_version", &text)?)
                    }
                    _ => {}
                }
            }
            Node::Empty(e) if e.name == "location" => {
                record.location_href = e.required_attr("href")?.to_string();
                record.location_base = e.attr_string("xml:base");
            }
            Node::End(name) if name == "data" => return Ok(record),
            Node::Eof => {
                return Err(MetadataError::UnexpectedEof {
                    element: "data".to_string(),
                })
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use deltarepo_utils::compression::compress_file;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_checksum_prefix() {
        let name = format!("{}-primary.xml.gz", "a".repeat(64));
        assert!(has_checksum_prefix(&name));
        assert_eq!(strip_checksum_prefix(&name), "primary.xml.gz");
        assert!(!has_checksum_prefix("primary.xml.gz"));
        assert!(!has_checksum_prefix("abc-primary.xml.gz"));
    }

    #[test]
    fn test_fill_and_rename() {
        let dir = tempdir().unwrap();
        let repodata = dir.path().join("repodata");
        fs::create_dir_all(&repodata).unwrap();
        let plain = repodata.join("group.xml");
        fs::write(&plain, b"<comps/>\n").unwrap();
        let compressed = repodata.join("group.xml.gz");
        compress_file(&plain, &compressed, CompressionType::Gz).unwrap();

        let mut rec = RepomdRecord::new("group_gz", &compressed);
        rec.fill(ChecksumType::Sha256).unwrap();
        assert_eq!(rec.location_href, "repodata/group.xml.gz");
        assert_eq!(rec.open_size, Some(9));
        assert_eq!(
            rec.open_checksum.as_deref(),
            Some(calculate_checksum(&plain, ChecksumType::Sha256).unwrap().as_str())
        );

        rec.rename_file().unwrap();
        let expected = format!("{}-group.xml.gz", rec.checksum);
        assert_eq!(rec.file_name(), expected);
        assert!(repodata.join(&expected).exists());
        assert!(!compressed.exists());

        let mut plain_rec = RepomdRecord::new("group", &plain);
        plain_rec.fill(ChecksumType::Md5).unwrap();
        assert_eq!(plain_rec.size, 9);
        assert_eq!(plain_rec.checksum.len(), 32);
        assert!(plain_rec.open_checksum.is_none());
    }

    #[test]
    fn test_repomd_roundtrip() {
        let dir = tempdir().unwrap();
        let repodata = dir.path().join("repodata");
        fs::create_dir_all(&repodata).unwrap();

        let mut repomd = Repomd {
            revision: Some("1700000000".to_string()),
            content_tags: vec!["binary-x86_64".to_string()],
            distro_tags: vec![DistroTag {
                cpeid: Some("cpe:/o:example:os:1".to_string()),
                name: "Example OS".to_string(),
            }],
            ..Default::default()
        };
        repomd.set_contenthash("abc", ChecksumType::Sha256);
        repomd.set_record(RepomdRecord {
            kind: "primary".to_string(),
            location_href: "repodata/primary.xml.gz".to_string(),
            checksum: "c1".to_string(),
            checksum_type: "sha256".to_string(),
            open_checksum: Some("o1".to_string()),
            open_checksum_type: Some("sha256".to_string()),
            timestamp: 10,
            size: 100,
            open_size: Some(200),
            ..Default::default()
        });
        repomd.set_record(RepomdRecord {
            kind: "filelists_db".to_string(),
            location_href: "repodata/filelists.sqlite.xz".to_string(),
            checksum: "c2".to_string(),
            checksum_type: "sha256".to_string(),
            timestamp: 20,
            size: 50,
            database_version: Some(10),
            ..Default::default()
        });

        let path = repodata.join("repomd.xml");
        repomd.write_file(&path).unwrap();
        let parsed = Repomd::parse_file(&path).unwrap();

        assert_eq!(parsed.revision.as_deref(), Some("1700000000"));
        assert_eq!(parsed.contenthash.as_deref(), Some("abc"));
        assert_eq!(parsed.contenthash_type.as_deref(), Some("sha256"));
        assert_eq!(parsed.distro_tags, repomd.distro_tags);
        assert_eq!(parsed.content_tags, repomd.content_tags);
        let kinds: Vec<_> = parsed.kinds().collect();
        assert_eq!(kinds, ["filelists_db", "primary"]);
        let primary = parsed.record("primary").unwrap();
        assert_eq!(primary.open_size, Some(200));
        assert_eq!(
            primary.location_real.as_deref(),
            Some(dir.path().join("repodata/primary.xml.gz").as_path())
        );
        assert_eq!(parsed.record("filelists_db").unwrap().database_version, Some(10));
        assert_eq!(parsed.max_timestamp(), 20);
    }

    #[test]
    fn test_set_and_remove_record() {
        let mut repomd = Repomd::default();
        repomd.set_record(RepomdRecord {
            kind: "primary".to_string(),
            size: 1,
            ..Default::default()
        });
        repomd.set_record(RepomdRecord {
            kind: "primary".to_string(),
            size: 2,
            ..Default::default()
        });
        assert_eq!(repomd.records.len(), 1);
        assert_eq!(repomd.record("primary").unwrap().size, 2);
        assert!(repomd.remove_record("primary").is_some());
        assert!(repomd.remove_record("primary").is_none());
    }
}
