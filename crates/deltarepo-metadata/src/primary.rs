use std::{
    io::{BufRead, BufReader, Read},
    path::Path,
};

use deltarepo_utils::compression::CompressionType;

use crate::{
    error::{MetadataError, MetadataResult},
    package::{Dependency, Package, PackageFile},
    xml::{Element, FileSink, Node, XmlSource, XmlSink},
    XML_COMMON_NS, XML_RPM_NS,
};

const DEPENDENCY_KINDS: [&str; 4] = [
    "rpm:provides",
    "rpm:requires",
    "rpm:conflicts",
    "rpm:obsoletes",
];

/// Pull parser over `primary.xml`, yielding packages in document order.
pub struct PrimaryReader<R> {
    source: XmlSource<R>,
    declared: Option<usize>,
    with_files: bool,
    done: bool,
}

impl PrimaryReader<BufReader<Box<dyn Read>>> {
    pub fn open<P: AsRef<Path>>(path: P) -> MetadataResult<Self> {
        Self::from_source(XmlSource::open(path)?)
    }
}

impl<R: BufRead> PrimaryReader<R> {
    pub fn from_source(mut source: XmlSource<R>) -> MetadataResult<Self> {
        let (root, has_content) = source.expect_root("metadata")?;
        Ok(Self {
            source,
            declared: root.parse_attr("packages")?,
            with_files: true,
            done: !has_content,
        })
    }

    /// Whether inline `<file>` entries are kept. Callers that read
    /// filelists.xml anyway turn this off.
    pub fn with_files(mut self, with_files: bool) -> Self {
        self.with_files = with_files;
        self
    }

    /// Value of the root `packages` attribute.
    pub fn declared_count(&self) -> Option<usize> {
        self.declared
    }

    fn read_package(&mut self) -> MetadataResult<Package> {
        let mut pkg = Package::default();
        loop {
            match self.source.next_node()? {
                Node::Start(e) => {
                    match e.name.as_str() {
                        "name" => pkg.name = self.source.read_text("name")?,
                        "arch" => pkg.arch = self.source.read_text("arch")?,
                        "checksum" => {
                            pkg.checksum_type = e.attr_string("type").unwrap_or_default();
                            pkg.pkgid = self.source.read_text("checksum")?;
                        }
                        "summary" => pkg.summary = self.source.read_text("summary")?,
                        "description" => {
                            pkg.description = self.source.read_text("description")?
                        }
                        "packager" => pkg.packager = self.source.read_text("packager")?,
                        "url" => pkg.url = self.source.read_text("url")?,
                        "format" => self.read_format(&mut pkg)?,
                        other => {
                            apply_package_attrs(&mut pkg, &e)?;
                            self.source.skip_element(other)?;
                        }
                    }
                }
                Node::Empty(e) => apply_package_attrs(&mut pkg, &e)?,
                Node::End(name) if name == "package" => return Ok(pkg),
                Node::Eof => {
                    return Err(MetadataError::UnexpectedEof {
                        element: "package".to_string(),
                    })
                }
                _ => {}
            }
        }
    }

    fn read_format(&mut self, pkg: &mut Package) -> MetadataResult<()> {
        loop {
            match self.source.next_node()? {
                Node::Start(e) => {
                    match e.name.as_str() {
                        "rpm:license" => pkg.license = self.source.read_text(&e.name)?,
                        "rpm:vendor" => pkg.vendor = self.source.read_text(&e.name)?,
                        "rpm:group" => pkg.group = self.source.read_text(&e.name)?,
                        "rpm:buildhost" => pkg.buildhost = self.source.read_text(&e.name)?,
                        "rpm:sourcerpm" => pkg.sourcerpm = self.source.read_text(&e.name)?,
                        "rpm:provides" => pkg.provides = self.read_dependencies(&e.name)?,
                        "rpm:requires" => pkg.requires = self.read_dependencies(&e.name)?,
                        "rpm:conflicts" => pkg.conflicts = self.read_dependencies(&e.name)?,
                        "rpm:obsoletes" => pkg.obsoletes = self.read_dependencies(&e.name)?,
                        "file" => {
                            let path = self.source.read_text("file")?;
                            if self.with_files {
                                pkg.files.push(PackageFile {
                                    path,
                                    file_type: e.attr_string("type"),
                                });
                            }
                        }
                        other => self.source.skip_element(other)?,
                    }
                }
                Node::Empty(e) if e.name == "rpm:header-range" => {
                    pkg.header_start = e.parse_attr("start")?.unwrap_or(0);
                    pkg.header_end = e.parse_attr("end")?.unwrap_or(0);
                }
                Node::End(name) if name == "format" => return Ok(()),
                Node::Eof => {
                    return Err(MetadataError::UnexpectedEof {
                        element: "format".to_string(),
                    })
                }
                _ => {}
            }
        }
    }

    fn read_dependencies(&mut self, container: &str) -> MetadataResult<Vec<Dependency>> {
        let mut deps = Vec::new();
        loop {
            match self.source.next_node()? {
                Node::Empty(e) if e.name == "rpm:entry" => {
                    deps.push(Dependency {
                        name: e.required_attr("name")?.to_string(),
                        flags: e.attr_string("flags"),
                        epoch: e.attr_string("epoch"),
                        version: e.attr_string("ver"),
                        release: e.attr_string("rel"),
                        pre: matches!(e.attr("pre"), Some("1" | "true")),
                    });
                }
                Node::Start(e) => self.source.skip_element(&e.name)?,
                Node::End(name) if name == container => return Ok(deps),
                Node::Eof => {
                    return Err(MetadataError::UnexpectedEof {
                        element: container.to_string(),
                    })
                }
                _ => {}
            }
        }
    }
}

fn apply_package_attrs(pkg: &mut Package, e: &Element) -> MetadataResult<()> {
    match e.name.as_str() {
        "version" => {
            pkg.epoch = e.attr_string("epoch").unwrap_or_default();
            pkg.version = e.attr_string("ver").unwrap_or_default();
            pkg.release = e.attr_string("rel").unwrap_or_default();
        }
        "time" => {
            pkg.time_file = e.parse_attr("file")?.unwrap_or(0);
            pkg.time_build = e.parse_attr("build")?.unwrap_or(0);
        }
        "size" => {
            pkg.size_package = e.parse_attr("package")?.unwrap_or(0);
            pkg.size_installed = e.parse_attr("installed")?.unwrap_or(0);
            pkg.size_archive = e.parse_attr("archive")?.unwrap_or(0);
        }
        "location" => {
            pkg.location_href = e.attr_string("href").unwrap_or_default();
            pkg.location_base = e.attr_string("xml:base");
        }
        _ => {}
    }
    Ok(())
}

impl<R: BufRead> Iterator for PrimaryReader<R> {
    type Item = MetadataResult<Package>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let node = match self.source.next_node() {
                Ok(node) => node,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };
            let result = match node {
                Node::Start(e) if e.name == "package" => self.read_package(),
                Node::Start(e) => {
                    match self.source.skip_element(&e.name) {
                        Ok(()) => continue,
                        Err(err) => Err(err),
                    }
                }
                Node::End(_) | Node::Eof => {
                    self.done = true;
                    return None;
                }
                _ => continue,
            };
            if result.is_err() {
                self.done = true;
            }
            return Some(result);
        }
    }
}

pub(crate) fn write_version<W: std::io::Write>(
    sink: &mut XmlSink<W>,
    pkg: &Package,
) -> MetadataResult<()> {
    sink.empty(
        "version",
        &[
            ("epoch", &pkg.epoch),
            ("ver", &pkg.version),
            ("rel", &pkg.release),
        ],
    )
}

fn write_dependencies<W: std::io::Write>(
    sink: &mut XmlSink<W>,
    container: &str,
    deps: &[Dependency],
) -> MetadataResult<()> {
    if deps.is_empty() {
        return Ok(());
    }
    sink.start(container, &[])?;
    for dep in deps {
        let mut attrs = vec![("name", dep.name.as_str())];
        if let Some(flags) = &dep.flags {
            attrs.push(("flags", flags));
        }
        if let Some(epoch) = &dep.epoch {
            attrs.push(("epoch", epoch));
        }
        if let Some(version) = &dep.version {
            attrs.push(("ver", version));
        }
        if let Some(release) = &dep.release {
            attrs.push(("rel", release));
        }
        if dep.pre {
            attrs.push(("pre", "1"));
        }
        sink.empty("rpm:entry", &attrs)?;
    }
    sink.end(container)
}

/// Streams packages into a new `primary.xml`.
pub struct PrimaryWriter {
    sink: FileSink,
}

impl PrimaryWriter {
    pub fn create<P: AsRef<Path>>(
        path: P,
        compression: CompressionType,
        package_count: usize,
    ) -> MetadataResult<Self> {
        let mut sink = FileSink::create(path, compression)?;
        let count = package_count.to_string();
        sink.start(
            "metadata",
            &[
                ("xmlns", XML_COMMON_NS),
                ("xmlns:rpm", XML_RPM_NS),
                ("packages", &count),
            ],
        )?;
        Ok(Self { sink })
    }

    pub fn add_package(&mut self, pkg: &Package) -> MetadataResult<()> {
        let sink = &mut self.sink;
        let time_file = pkg.time_file.to_string();
        let time_build = pkg.time_build.to_string();
        let size_package = pkg.size_package.to_string();
        let size_installed = pkg.size_installed.to_string();
        let size_archive = pkg.size_archive.to_string();

        sink.start("package", &[("type", "rpm")])?;
        sink.text_element("name", &[], &pkg.name)?;
        sink.text_element("arch", &[], &pkg.arch)?;
        write_version(sink, pkg)?;
        sink.text_element(
            "checksum",
            &[("type", &pkg.checksum_type), ("pkgid", "YES")],
            &pkg.pkgid,
        )?;
        sink.text_element("summary", &[], &pkg.summary)?;
        sink.text_element("description", &[], &pkg.description)?;
        sink.text_element("packager", &[], &pkg.packager)?;
        sink.text_element("url", &[], &pkg.url)?;
        sink.empty("time", &[("file", &time_file), ("build", &time_build)])?;
        sink.empty(
            "size",
            &[
                ("package", &size_package),
                ("installed", &size_installed),
                ("archive", &size_archive),
            ],
        )?;
        match &pkg.location_base {
            Some(base) => {
                sink.empty("location", &[("xml:base", base), ("href", &pkg.location_href)])?
            }
            None => sink.empty("location", &[("href", &pkg.location_href)])?,
        }

        sink.start("format", &[])?;
        sink.text_element("rpm:license", &[], &pkg.license)?;
        sink.text_element("rpm:vendor", &[], &pkg.vendor)?;
        sink.text_element("rpm:group", &[], &pkg.group)?;
        sink.text_element("rpm:buildhost", &[], &pkg.buildhost)?;
        sink.text_element("rpm:sourcerpm", &[], &pkg.sourcerpm)?;
        let header_start = pkg.header_start.to_string();
        let header_end = pkg.header_end.to_string();
        sink.empty(
            "rpm:header-range",
            &[("start", &header_start), ("end", &header_end)],
        )?;
        let dependency_lists = [&pkg.provides, &pkg.requires, &pkg.conflicts, &pkg.obsoletes];
        for (container, deps) in DEPENDENCY_KINDS.iter().zip(dependency_lists) {
            write_dependencies(sink, container, deps)?;
        }
        for file in pkg.primary_files() {
            match &file.file_type {
                Some(file_type) => sink.text_element("file", &[("type", file_type)], &file.path)?,
                None => sink.text_element("file", &[], &file.path)?,
            }
        }
        sink.end("format")?;
        sink.end("package")
    }

    pub fn finish(mut self) -> MetadataResult<()> {
        self.sink.end("metadata")?;
        self.sink.finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;
    use crate::package::Changelog;

    pub(crate) fn sample_package(name: &str, pkgid: &str) -> Package {
        Package {
            pkgid: pkgid.to_string(),
            checksum_type: "sha256".to_string(),
            name: name.to_string(),
            arch: "x86_64".to_string(),
            epoch: "0".to_string(),
            version: "1.0".to_string(),
            release: "1".to_string(),
            summary: format!("{name} summary"),
            description: "A <test> package & more".to_string(),
            location_href: format!("Packages/{name}-1.0-1.x86_64.rpm"),
            time_file: 1700000000,
            size_package: 1234,
            requires: vec![Dependency {
                name: "libc.so.6".to_string(),
                pre: true,
                ..Default::default()
            }],
            provides: vec![Dependency {
                name: name.to_string(),
                flags: Some("EQ".to_string()),
                epoch: Some("0".to_string()),
                version: Some("1.0".to_string()),
                release: Some("1".to_string()),
                pre: false,
            }],
            files: vec![
                PackageFile::new(format!("/usr/bin/{name}")),
                PackageFile::new(format!("/usr/share/doc/{name}/README")),
                PackageFile::dir(format!("/etc/{name}.d")),
            ],
            changelogs: vec![Changelog {
                author: "Packager <p@example.com> - 1.0-1".to_string(),
                date: 1690000000,
                text: "- Initial build".to_string(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_primary_roundtrip_and_determinism() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("primary.xml.gz");
        let packages = [sample_package("foo", "aaa"), sample_package("bar", "bbb")];

        let mut writer = PrimaryWriter::create(&path, CompressionType::Gz, packages.len()).unwrap();
        for pkg in &packages {
            writer.add_package(pkg).unwrap();
        }
        writer.finish().unwrap();

        let reader = PrimaryReader::open(&path).unwrap();
        assert_eq!(reader.declared_count(), Some(2));
        let parsed: Vec<Package> = reader.collect::<MetadataResult<_>>().unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "foo");
        assert_eq!(parsed[0].pkgid, "aaa");
        assert_eq!(parsed[0].description, "A <test> package & more");
        assert_eq!(parsed[0].location_href, "Packages/foo-1.0-1.x86_64.rpm");
        assert_eq!(parsed[0].size_package, 1234);
        assert_eq!(parsed[0].provides, packages[0].provides);
        assert!(parsed[0].requires[0].pre);
        let files: Vec<_> = parsed[0].files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(files, ["/usr/bin/foo", "/etc/foo.d"]);

        let plain = dir.path().join("again.xml");
        let mut writer =
            PrimaryWriter::create(&plain, CompressionType::None, parsed.len()).unwrap();
        for pkg in &parsed {
            writer.add_package(pkg).unwrap();
        }
        writer.finish().unwrap();
        let plain2 = dir.path().join("again2.xml");
        let mut writer =
            PrimaryWriter::create(&plain2, CompressionType::None, packages.len()).unwrap();
        for pkg in &packages {
            writer.add_package(pkg).unwrap();
        }
        writer.finish().unwrap();
        assert_eq!(fs::read(&plain).unwrap(), fs::read(&plain2).unwrap());
    }

    #[test]
    fn test_primary_without_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("primary.xml");
        let mut writer = PrimaryWriter::create(&path, CompressionType::None, 1).unwrap();
        writer.add_package(&sample_package("foo", "aaa")).unwrap();
        writer.finish().unwrap();

        let parsed: Vec<Package> = PrimaryReader::open(&path)
            .unwrap()
            .with_files(false)
            .collect::<MetadataResult<_>>()
            .unwrap();
        assert!(parsed[0].files.is_empty());
    }

    #[test]
    fn test_primary_location_base() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<metadata xmlns="http://linux.duke.edu/metadata/common" packages="1">
<package type="rpm">
  <name>p1</name>
  <checksum type="sha256" pkgid="YES">aaa</checksum>
  <location xml:base="http://mirror/" href="p1.rpm"/>
  <unknown><nested/></unknown>
</package>
</metadata>"#;
        let reader = PrimaryReader::from_source(XmlSource::from_reader(xml.as_bytes())).unwrap();
        let parsed: Vec<Package> = reader.collect::<MetadataResult<_>>().unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].location_base.as_deref(), Some("http://mirror/"));
        assert_eq!(parsed[0].location_href, "p1.rpm");
    }

    #[test]
    fn test_primary_empty_and_truncated() {
        let empty = r#"<metadata packages="0"/>"#;
        let reader = PrimaryReader::from_source(XmlSource::from_reader(empty.as_bytes())).unwrap();
        assert_eq!(reader.count(), 0);

        let truncated = r#"<metadata packages="1"><package><name>p1</name>"#;
        let mut reader =
            PrimaryReader::from_source(XmlSource::from_reader(truncated.as_bytes())).unwrap();
        assert!(matches!(reader.next(), Some(Err(_))));
        assert!(reader.next().is_none());
    }
}
