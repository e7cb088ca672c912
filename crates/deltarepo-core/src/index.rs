//! The `deltarepos.xml` catalog listing the deltas available in a directory.

use std::{
    collections::BTreeMap,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use deltarepo_metadata::{
    xml::{render, write_by_suffix, Element, Node, XmlSink, XmlSource},
    MetadataError, Repomd,
};
use deltarepo_utils::{
    compression::{create_decoder, CompressionType},
    hash::calculate_checksum,
    lock::DirLock,
};
use tracing::{debug, info, warn};

use crate::{
    constants::{DELTAMETADATA, INDEX_REPOMD_CHECKSUM},
    deltametadata::DeltaMetadata,
    error::{DeltaRepoError, ErrorContext},
    generator::{DeltaGenerator, GenerateOptions, GeneratedDelta},
    plugins::PluginRegistry,
    utils::{ensure_repository, is_repository, repomd_path},
    DeltaRepoResult,
};

/// One `<deltarepo>` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaIndexRecord {
    pub location_href: String,
    pub location_base: Option<String>,
    pub size_total: u64,
    pub revision_src: Option<String>,
    pub revision_dst: Option<String>,
    pub contenthash_src: Option<String>,
    pub contenthash_dst: Option<String>,
    pub contenthash_type: Option<String>,
    pub timestamp_src: Option<i64>,
    pub timestamp_dst: Option<i64>,
    /// Size of every metadata file of the delta, by record type.
    pub data: BTreeMap<String, u64>,
    pub repomd_timestamp: Option<i64>,
    pub repomd_size: Option<u64>,
    pub repomd_checksums: Vec<(String, String)>,
}

impl DeltaIndexRecord {
    /// Describes the delta repository at `path`. The location is stored
    /// relative to `index_dir` when `path` lives below it.
    pub fn from_delta_dir<P: AsRef<Path>, Q: AsRef<Path>>(
        path: P,
        index_dir: Q,
    ) -> DeltaRepoResult<Self> {
        let path = path.as_ref();
        ensure_repository(path)?;

        let repomd_file = repomd_path(path);
        let repomd = Repomd::parse_file(&repomd_file)?;
        let notes_record = repomd.record(DELTAMETADATA).ok_or_else(|| {
            DeltaRepoError::DeltaMetadata(format!(
                "{} is not a delta repository",
                path.display()
            ))
        })?;
        let notes = DeltaMetadata::parse_file(notes_record.real_path()?)?;

        let meta = fs::metadata(&repomd_file)
            .with_context(|| format!("reading metadata of {}", repomd_file.display()))?;
        let repomd_timestamp = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);
        let repomd_checksum = calculate_checksum(&repomd_file, INDEX_REPOMD_CHECKSUM)?;

        let data: BTreeMap<String, u64> = repomd
            .records
            .iter()
            .map(|rec| (rec.kind.clone(), rec.size))
            .collect();
        let size_total = data.values().sum::<u64>() + meta.len();

        Ok(Self {
            location_href: relative_location(path, index_dir.as_ref()),
            location_base: None,
            size_total,
            revision_src: notes.revision_src,
            revision_dst: notes.revision_dst,
            contenthash_src: notes.contenthash_src,
            contenthash_dst: notes.contenthash_dst,
            contenthash_type: notes.contenthash_type,
            timestamp_src: notes.timestamp_src,
            timestamp_dst: notes.timestamp_dst,
            data,
            repomd_timestamp,
            repomd_size: Some(meta.len()),
            repomd_checksums: vec![(INDEX_REPOMD_CHECKSUM.name().to_string(), repomd_checksum)],
        })
    }

    fn write<W: std::io::Write>(&self, sink: &mut XmlSink<W>) -> Result<(), MetadataError> {
        sink.start("deltarepo", &[])?;

        let mut attrs = vec![("href", self.location_href.as_str())];
        if let Some(base) = &self.location_base {
            attrs.push(("base", base.as_str()));
        }
        sink.empty("location", &attrs)?;

        sink.empty("size", &[("total", &self.size_total.to_string())])?;

        if let (Some(src), Some(dst)) = (&self.revision_src, &self.revision_dst) {
            sink.empty("revision", &[("src", src), ("dst", dst)])?;
        }
        if let (Some(src), Some(dst), Some(hash_type)) = (
            &self.contenthash_src,
            &self.contenthash_dst,
            &self.contenthash_type,
        ) {
            sink.empty("contenthash", &[("src", src), ("dst", dst), ("type", hash_type)])?;
        }
        if let (Some(src), Some(dst)) = (self.timestamp_src, self.timestamp_dst) {
            sink.empty(
                "timestamp",
                &[("src", &src.to_string()), ("dst", &dst.to_string())],
            )?;
        }
        for (kind, size) in &self.data {
            sink.empty("data", &[("type", kind), ("size", &size.to_string())])?;
        }

        sink.start("repomd", &[])?;
        if let Some(timestamp) = self.repomd_timestamp {
            sink.text_element("timestamp", &[], &timestamp.to_string())?;
        }
        if let Some(size) = self.repomd_size {
            sink.text_element("size", &[], &size.to_string())?;
        }
        for (checksum_type, value) in &self.repomd_checksums {
            sink.text_element("checksum", &[("type", checksum_type)], value)?;
        }
        sink.end("repomd")?;

        sink.end("deltarepo")
    }

    fn read<R: BufRead>(source: &mut XmlSource<R>) -> DeltaRepoResult<Self> {
        let mut record = Self::default();
        let mut has_location = false;

        loop {
            let (element, has_content) = match source.next_node()? {
                Node::Start(e) => (e, true),
                Node::Empty(e) => (e, false),
                Node::End(_) => break,
                Node::Eof => {
                    return Err(MetadataError::UnexpectedEof {
                        element: "deltarepo".to_string(),
                    }
                    .into())
                }
                _ => continue,
            };

            match element.name.as_str() {
                "location" => {
                    record.location_href = element.required_attr("href")?.to_string();
                    record.location_base = element.attr_string("base");
                    has_location = true;
                }
                "size" => record.size_total = element.parse_attr("total")?.unwrap_or(0),
                "revision" => {
                    record.revision_src = element.attr_string("src");
                    record.revision_dst = element.attr_string("dst");
                }
                "contenthash" => {
                    record.contenthash_src = element.attr_string("src");
                    record.contenthash_dst = element.attr_string("dst");
                    record.contenthash_type = element.attr_string("type");
                }
                "timestamp" => {
                    record.timestamp_src = element.parse_attr("src")?;
                    record.timestamp_dst = element.parse_attr("dst")?;
                }
                "data" => {
                    if let Some(kind) = element.attr_string("type") {
                        record.data.insert(kind, element.parse_attr("size")?.unwrap_or(0));
                    }
                }
                "repomd" if has_content => {
                    record.read_repomd(source)?;
                    continue;
                }
                _ => {}
            }
            if has_content {
                source.skip_element(&element.name)?;
            }
        }

        if !has_location {
            return Err(MetadataError::MissingAttribute {
                element: "location".to_string(),
                attribute: "href".to_string(),
            }
            .into());
        }
        Ok(record)
    }

    fn read_repomd<R: BufRead>(&mut self, source: &mut XmlSource<R>) -> DeltaRepoResult<()> {
        loop {
            match source.next_node()? {
                Node::Start(e) => {
                    let text = source.read_text(&e.name)?;
                    match e.name.as_str() {
                        "timestamp" => self.repomd_timestamp = parse_number(&e, &text)?,
                        "size" => self.repomd_size = parse_number(&e, &text)?,
                        "checksum" => {
                            if let Some(checksum_type) = e.attr_string("type") {
                                if !text.is_empty() {
                                    self.repomd_checksums.push((checksum_type, text));
                                }
                            }
                        }
                        _ => {}
                    }
                }
                Node::End(_) | Node::Eof => return Ok(()),
                _ => {}
            }
        }
    }

    /// `<src>-<dst>` when both content hashes are known.
    pub fn id(&self) -> Option<String> {
        match (&self.contenthash_src, &self.contenthash_dst) {
            (Some(src), Some(dst)) => Some(format!("{src}-{dst}")),
            _ => None,
        }
    }
}

fn parse_number<T: std::str::FromStr>(
    element: &Element,
    text: &str,
) -> DeltaRepoResult<Option<T>> {
    if text.is_empty() {
        return Ok(None);
    }
    text.trim().parse().map(Some).map_err(|_| {
        MetadataError::InvalidValue {
            element: element.name.clone(),
            value: text.to_string(),
        }
        .into()
    })
}

fn relative_location(path: &Path, index_dir: &Path) -> String {
    let relative = match (path.canonicalize(), index_dir.canonicalize()) {
        (Ok(path), Ok(dir)) => path.strip_prefix(&dir).map(Path::to_path_buf).ok(),
        _ => None,
    };
    relative
        .unwrap_or_else(|| path.to_path_buf())
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// The whole catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaIndex {
    pub records: Vec<DeltaIndexRecord>,
}

impl DeltaIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record, replacing the one with the same location.
    pub fn upsert(&mut self, record: DeltaIndexRecord) {
        match self
            .records
            .iter_mut()
            .find(|r| r.location_href == record.location_href)
        {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn to_xml(&self) -> DeltaRepoResult<Vec<u8>> {
        let mut records: Vec<&DeltaIndexRecord> = self.records.iter().collect();
        records.sort_by(|a, b| a.location_href.cmp(&b.location_href));

        Ok(render(|sink| {
            if records.is_empty() {
                return sink.empty("deltarepos", &[]);
            }
            sink.start("deltarepos", &[])?;
            for record in records {
                record.write(sink)?;
            }
            sink.end("deltarepos")
        })?)
    }

    /// Writes the index, compressed according to the file suffix.
    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> DeltaRepoResult<()> {
        Ok(write_by_suffix(path, &self.to_xml()?)?)
    }

    pub fn parse_file<P: AsRef<Path>>(path: P) -> DeltaRepoResult<Self> {
        Self::parse_source(XmlSource::open(path)?)
    }

    /// Parses an index held in memory, plain or compressed.
    pub fn parse_bytes(data: &[u8]) -> DeltaRepoResult<Self> {
        let compression = CompressionType::from_magic_bytes(data);
        let reader = create_decoder(data, compression)
            .with_context(|| format!("decompressing {} delta index", compression.name()))?;
        Self::parse_source(XmlSource::from_reader(BufReader::new(reader)))
    }

    pub fn parse_source<R: BufRead>(mut source: XmlSource<R>) -> DeltaRepoResult<Self> {
        let mut index = Self::new();
        let (_, has_content) = source.expect_root("deltarepos")?;
        if !has_content {
            return Ok(index);
        }

        loop {
            match source.next_node()? {
                Node::Start(e) if e.name == "deltarepo" => {
                    index.records.push(DeltaIndexRecord::read(&mut source)?);
                }
                Node::Start(e) => source.skip_element(&e.name)?,
                Node::Empty(e) if e.name == "deltarepo" => {
                    return Err(MetadataError::MissingAttribute {
                        element: "location".to_string(),
                        attribute: "href".to_string(),
                    }
                    .into())
                }
                Node::End(_) | Node::Eof => break,
                _ => {}
            }
        }
        Ok(index)
    }
}

/// Delta repositories below `dir`, in a stable order. Directories starting
/// with a dot, like scratch directories, are skipped.
fn find_delta_dirs(dir: &Path, found: &mut Vec<PathBuf>) -> DeltaRepoResult<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("reading directory {}", dir.display()))?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter(|path| {
            !path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with('.'))
        })
        .collect();
    entries.sort();

    for entry in entries {
        if is_repository(&entry) {
            found.push(entry);
        } else {
            find_delta_dirs(&entry, found)?;
        }
    }
    Ok(())
}

/// Rebuilds `<dir>/<index_filename>` from every delta repository below
/// `dir`. With `force`, directories that can't be indexed are skipped.
pub fn rebuild_index<P: AsRef<Path>>(
    dir: P,
    index_filename: &str,
    force: bool,
) -> DeltaRepoResult<DeltaIndex> {
    let dir = dir.as_ref();
    let mut delta_dirs = Vec::new();
    find_delta_dirs(dir, &mut delta_dirs)?;

    let mut index = DeltaIndex::new();
    for delta_dir in delta_dirs {
        match DeltaIndexRecord::from_delta_dir(&delta_dir, dir) {
            Ok(record) => {
                debug!("Indexed {}", delta_dir.display());
                index.upsert(record);
            }
            Err(err) if force => {
                warn!("Bad repository {}: {}", delta_dir.display(), err);
            }
            Err(err) => return Err(err),
        }
    }

    let _lock = DirLock::acquire(dir)?;
    index.write_file(dir.join(index_filename))?;
    info!(
        "Wrote {} with {} deltas",
        dir.join(index_filename).display(),
        index.len()
    );
    Ok(index)
}

/// Generates the delta `old -> new` into `dir` and adds it to the index
/// found there.
pub fn generate_into_index_dir<P: AsRef<Path>, Q: AsRef<Path>, D: AsRef<Path>>(
    registry: &PluginRegistry,
    options: GenerateOptions,
    old: P,
    new: Q,
    dir: D,
    index_filename: &str,
) -> DeltaRepoResult<(GeneratedDelta, DeltaIndexRecord)> {
    let dir = dir.as_ref();
    let options = GenerateOptions {
        out_path: dir.to_path_buf(),
        fixed_output: false,
        ..options
    };
    let _lock = DirLock::acquire(dir)?;

    let delta = DeltaGenerator::new(registry, options).generate(old, new)?;
    let record = DeltaIndexRecord::from_delta_dir(&delta.path, dir)?;

    let index_path = dir.join(index_filename);
    let mut index = if index_path.is_file() {
        DeltaIndex::parse_file(&index_path)?
    } else {
        DeltaIndex::new()
    };
    index.upsert(record.clone());
    index.write_file(&index_path)?;
    info!("Added {} to {}", record.location_href, index_path.display());

    Ok((delta, record))
}
