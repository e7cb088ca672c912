//! `deltametadata.xml`: the notes plugins leave for themselves at
//! generation time and read back at application time.

use std::{
    collections::BTreeMap,
    io::BufRead,
    path::{Path, PathBuf},
};

use deltarepo_metadata::xml::{render, write_by_suffix, Element, Node, XmlSink, XmlSource};
use deltarepo_utils::compression::CompressionType;

use crate::{constants::DELTAMETADATA_FILENAME, error::DeltaRepoError, DeltaRepoResult};

/// List holding one attribute bag per metadata kind.
pub const METADATA_LIST: &str = "metadata";

/// Per-kind notes such as `unchanged=1` or `database=0`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataNotes(BTreeMap<String, String>);

impl MetadataNotes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.0.insert(key.into(), value.into());
    }

    pub fn set_flag<K: Into<String>>(&mut self, key: K, value: bool) {
        self.set(key, if value { "1" } else { "0" });
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// `true` only for an explicit `"1"`.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key) == Some("1")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn extend(&mut self, other: MetadataNotes) {
        self.0.extend(other.0);
    }
}

/// Everything one plugin stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginBundle {
    pub name: String,
    pub version: u32,
    attributes: BTreeMap<String, String>,
    lists: BTreeMap<String, Vec<BTreeMap<String, String>>>,
}

impl PluginBundle {
    pub fn new<S: Into<String>>(name: S, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            attributes: BTreeMap::new(),
            lists: BTreeMap::new(),
        }
    }

    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn append<S: Into<String>>(&mut self, list: S, entry: BTreeMap<String, String>) {
        self.lists.entry(list.into()).or_default().push(entry);
    }

    pub fn list(&self, list: &str) -> &[BTreeMap<String, String>] {
        self.lists.get(list).map(Vec::as_slice).unwrap_or_default()
    }

    /// Notes stored for a metadata kind, if any.
    pub fn metadata_notes(&self, kind: &str) -> Option<MetadataNotes> {
        self.list(METADATA_LIST)
            .iter()
            .find(|entry| entry.get("type").map(String::as_str) == Some(kind))
            .map(|entry| {
                let mut notes = MetadataNotes(entry.clone());
                notes.0.remove("type");
                notes
            })
    }

    pub fn set_metadata_notes(&mut self, kind: &str, notes: MetadataNotes) {
        let mut entry = notes.0;
        entry.insert("type".to_string(), kind.to_string());
        self.append(METADATA_LIST, entry);
    }

    fn write<W: std::io::Write>(
        &self,
        sink: &mut XmlSink<W>,
    ) -> Result<(), deltarepo_metadata::MetadataError> {
        let version = self.version.to_string();
        let mut attrs: Vec<(&str, &str)> = vec![("name", &self.name), ("version", &version)];
        attrs.extend(
            self.attributes
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );

        if self.lists.values().all(Vec::is_empty) {
            return sink.empty("plugin", &attrs);
        }

        sink.start("plugin", &attrs)?;
        for (name, entries) in &self.lists {
            for entry in entries {
                let entry_attrs: Vec<(&str, &str)> =
                    entry.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                sink.empty(name, &entry_attrs)?;
            }
        }
        sink.end("plugin")
    }

    fn from_element(element: &Element) -> DeltaRepoResult<Self> {
        let mut name = None;
        let mut version = None;
        let mut attributes = BTreeMap::new();
        for (key, value) in &element.attributes {
            match key.as_str() {
                "name" => name = Some(value.clone()),
                "version" => version = Some(value.clone()),
                _ => {
                    attributes.insert(key.clone(), value.clone());
                }
            }
        }

        let (Some(name), Some(version)) = (name, version) else {
            return Err(DeltaRepoError::DeltaMetadata(
                "name or version attribute of plugin element is missing".to_string(),
            ));
        };
        let version = version.trim().parse().map_err(|_| {
            DeltaRepoError::DeltaMetadata(format!(
                "version {version} of plugin {name} is not an integer"
            ))
        })?;

        Ok(Self {
            name,
            version,
            attributes,
            lists: BTreeMap::new(),
        })
    }
}

/// The parsed `deltametadata.xml`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaMetadata {
    pub revision_src: Option<String>,
    pub revision_dst: Option<String>,
    pub contenthash_src: Option<String>,
    pub contenthash_dst: Option<String>,
    pub contenthash_type: Option<String>,
    pub timestamp_src: Option<i64>,
    pub timestamp_dst: Option<i64>,
    plugins: BTreeMap<String, PluginBundle>,
}

impl DeltaMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bundle(&mut self, bundle: PluginBundle) {
        self.plugins.insert(bundle.name.clone(), bundle);
    }

    pub fn bundle(&self, name: &str) -> Option<&PluginBundle> {
        self.plugins.get(name)
    }

    pub fn bundles(&self) -> impl Iterator<Item = &PluginBundle> {
        self.plugins.values()
    }

    pub fn to_xml(&self) -> DeltaRepoResult<Vec<u8>> {
        Ok(render(|sink| {
            sink.start("deltametadata", &[])?;

            let mut attrs = Vec::new();
            if let Some(src) = &self.revision_src {
                attrs.push(("src", src.as_str()));
            }
            if let Some(dst) = &self.revision_dst {
                attrs.push(("dst", dst.as_str()));
            }
            if !attrs.is_empty() {
                sink.empty("revision", &attrs)?;
            }

            if let Some(hash_type) = &self.contenthash_type {
                let mut attrs = vec![("type", hash_type.as_str())];
                if let Some(src) = &self.contenthash_src {
                    attrs.push(("src", src.as_str()));
                }
                if let Some(dst) = &self.contenthash_dst {
                    attrs.push(("dst", dst.as_str()));
                }
                if attrs.len() > 1 {
                    sink.empty("contenthash", &attrs)?;
                }
            }

            let src = self.timestamp_src.map(|t| t.to_string());
            let dst = self.timestamp_dst.map(|t| t.to_string());
            let mut attrs = Vec::new();
            if let Some(src) = &src {
                attrs.push(("src", src.as_str()));
            }
            if let Some(dst) = &dst {
                attrs.push(("dst", dst.as_str()));
            }
            if !attrs.is_empty() {
                sink.empty("timestamp", &attrs)?;
            }

            if self.plugins.is_empty() {
                sink.empty("usedplugins", &[])?;
            } else {
                sink.start("usedplugins", &[])?;
                for bundle in self.plugins.values() {
                    bundle.write(sink)?;
                }
                sink.end("usedplugins")?;
            }
            sink.end("deltametadata")
        })?)
    }

    /// Writes `deltametadata.xml<suffix>` into `dir` and returns its path.
    pub fn write_into<P: AsRef<Path>>(
        &self,
        dir: P,
        compression: CompressionType,
    ) -> DeltaRepoResult<PathBuf> {
        let path = dir
            .as_ref()
            .join(format!("{DELTAMETADATA_FILENAME}{}", compression.suffix()));
        write_by_suffix(&path, &self.to_xml()?)?;
        Ok(path)
    }

    pub fn parse_file<P: AsRef<Path>>(path: P) -> DeltaRepoResult<Self> {
        Self::parse_source(XmlSource::open(path)?)
    }

    pub fn parse_source<R: BufRead>(mut source: XmlSource<R>) -> DeltaRepoResult<Self> {
        let mut dm = Self::new();
        let (_, has_content) = source.expect_root("deltametadata")?;
        if !has_content {
            return Ok(dm);
        }

        loop {
            let (element, has_content) = match source.next_node()? {
                Node::Start(e) => (e, true),
                Node::Empty(e) => (e, false),
                Node::End(_) | Node::Eof => break,
                _ => continue,
            };

            match element.name.as_str() {
                "revision" => {
                    dm.revision_src = element.attr_string("src");
                    dm.revision_dst = element.attr_string("dst");
                }
                "contenthash" => {
                    dm.contenthash_src = element.attr_string("src");
                    dm.contenthash_dst = element.attr_string("dst");
                    dm.contenthash_type = element.attr_string("type");
                }
                "timestamp" => {
                    dm.timestamp_src = element.parse_attr("src")?;
                    dm.timestamp_dst = element.parse_attr("dst")?;
                }
                "usedplugins" if has_content => {
                    dm.read_plugins(&mut source)?;
                    continue;
                }
                _ => {}
            }
            if has_content {
                source.skip_element(&element.name)?;
            }
        }
        Ok(dm)
    }

    fn read_plugins<R: BufRead>(&mut self, source: &mut XmlSource<R>) -> DeltaRepoResult<()> {
        loop {
            match source.next_node()? {
                Node::Empty(e) if e.name == "plugin" => {
                    self.add_bundle(PluginBundle::from_element(&e)?);
                }
                Node::Start(e) if e.name == "plugin" => {
                    let mut bundle = PluginBundle::from_element(&e)?;
                    read_lists(source, &mut bundle)?;
                    self.add_bundle(bundle);
                }
                Node::Start(e) => source.skip_element(&e.name)?,
                Node::End(_) | Node::Eof => return Ok(()),
                _ => {}
            }
        }
    }
}

fn read_lists<R: BufRead>(
    source: &mut XmlSource<R>,
    bundle: &mut PluginBundle,
) -> DeltaRepoResult<()> {
    loop {
        match source.next_node()? {
            Node::Empty(e) => {
                bundle.append(e.name, e.attributes.into_iter().collect());
            }
            Node::Start(e) => {
                source.skip_element(&e.name)?;
                bundle.append(e.name, e.attributes.into_iter().collect());
            }
            Node::End(_) | Node::Eof => return Ok(()),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn parse(xml: &str) -> DeltaRepoResult<DeltaMetadata> {
        DeltaMetadata::parse_source(XmlSource::from_reader(xml.as_bytes()))
    }

    #[test]
    fn test_empty_document() {
        let xml = String::from_utf8(DeltaMetadata::new().to_xml().unwrap()).unwrap();
        assert!(xml.contains("<deltametadata>"));
        assert!(xml.contains("<usedplugins/>"));
        assert!(!xml.contains("contenthash"));

        let parsed = parse(&xml).unwrap();
        assert_eq!(parsed, DeltaMetadata::new());
    }

    #[test]
    fn test_full_document_survives_write_and_parse() {
        let dir = tempdir().unwrap();

        let mut dm = DeltaMetadata::new();
        dm.revision_src = Some("1".to_string());
        dm.revision_dst = Some("2".to_string());
        dm.contenthash_type = Some("sha256".to_string());
        dm.contenthash_src = Some("aaa".to_string());
        dm.contenthash_dst = Some("bbb".to_string());
        dm.timestamp_src = Some(100);
        dm.timestamp_dst = Some(200);

        let mut bundle = PluginBundle::new("MainDeltaPlugin", 1);
        bundle.set("contenthash_type", "sha256");
        let mut notes = MetadataNotes::new();
        notes.set_flag("unchanged", true);
        notes.set("checksum_name", "sha256");
        bundle.set_metadata_notes("primary", notes);
        let mut notes = MetadataNotes::new();
        notes.set_flag("database", false);
        bundle.set_metadata_notes("other", notes);
        dm.add_bundle(bundle);
        dm.add_bundle(PluginBundle::new("GeneralDeltaPlugin", 1));

        let path = dm.write_into(dir.path(), CompressionType::Xz).unwrap();
        assert!(path.ends_with("deltametadata.xml.xz"));

        let parsed = DeltaMetadata::parse_file(&path).unwrap();
        assert_eq!(parsed, dm);

        let main = parsed.bundle("MainDeltaPlugin").unwrap();
        let primary = main.metadata_notes("primary").unwrap();
        assert!(primary.flag("unchanged"));
        assert_eq!(primary.get("checksum_name"), Some("sha256"));
        assert_eq!(primary.get("type"), None);
        assert!(!main.metadata_notes("other").unwrap().flag("database"));
        assert!(main.metadata_notes("filelists").is_none());
    }

    #[test]
    fn test_output_is_deterministic() {
        let build = |order: &[&str]| {
            let mut dm = DeltaMetadata::new();
            for name in order {
                let mut bundle = PluginBundle::new(*name, 1);
                bundle.set("zeta", "1");
                bundle.set("alpha", "2");
                dm.add_bundle(bundle);
            }
            dm.to_xml().unwrap()
        };
        assert_eq!(build(&["B", "A"]), build(&["A", "B"]));

        let xml = String::from_utf8(build(&["A"])).unwrap();
        assert!(xml.contains(r#"<plugin name="A" version="1" alpha="2" zeta="1"/>"#));
    }

    #[test]
    fn test_plugin_without_version_is_rejected() {
        let err = parse(
            r#"<deltametadata><usedplugins><plugin name="X"/></usedplugins></deltametadata>"#,
        )
        .unwrap_err();
        assert!(matches!(err, DeltaRepoError::DeltaMetadata(_)));
    }

    #[test]
    fn test_non_integer_version_is_rejected() {
        let xml = concat!(
            r#"<deltametadata><usedplugins>"#,
            r#"<plugin name="X" version="one"/>"#,
            r#"</usedplugins></deltametadata>"#,
        );
        let err = parse(xml).unwrap_err();
        assert!(matches!(err, DeltaRepoError::DeltaMetadata(_)));
    }
}
