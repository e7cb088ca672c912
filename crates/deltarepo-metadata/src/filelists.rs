use std::{
    io::{BufRead, BufReader, Read},
    path::Path,
};

use deltarepo_utils::compression::CompressionType;

use crate::{
    error::{MetadataError, MetadataResult},
    package::{Package, PackageFile},
    primary::write_version,
    xml::{FileSink, Node, XmlSource},
    XML_FILELISTS_NS,
};

/// The file list of one package from `filelists.xml`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilelistsEntry {
    pub pkgid: String,
    pub name: String,
    pub arch: String,
    pub files: Vec<PackageFile>,
}

pub struct FilelistsReader<R> {
    source: XmlSource<R>,
    done: bool,
}

impl FilelistsReader<BufReader<Box<dyn Read>>> {
    pub fn open<P: AsRef<Path>>(path: P) -> MetadataResult<Self> {
        Self::from_source(XmlSource::open(path)?)
    }
}

impl<R: BufRead> FilelistsReader<R> {
    pub fn from_source(mut source: XmlSource<R>) -> MetadataResult<Self> {
        let (_, has_content) = source.expect_root("filelists")?;
        Ok(Self {
            source,
            done: !has_content,
        })
    }

    fn read_entry(&mut self, mut entry: FilelistsEntry) -> MetadataResult<FilelistsEntry> {
        loop {
            match self.source.next_node()? {
                Node::Start(e) if e.name == "file" => {
                    let path = self.source.read_text("file")?;
                    entry.files.push(PackageFile {
                        path,
                        file_type: e.attr_string("type"),
                    });
                }
                Node::Start(e) => self.source.skip_element(&e.name)?,
                Node::End(name) if name == "package" => return Ok(entry),
                Node::Eof => {
                    return Err(MetadataError::UnexpectedEof {
                        element: "package".to_string(),
                    })
                }
                _ => {}
            }
        }
    }
}

impl<R: BufRead> Iterator for FilelistsReader<R> {
    type Item = MetadataResult<FilelistsEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let result = match self.source.next_node() {
                Ok(Node::Start(e)) if e.name == "package" => {
                    let entry = FilelistsEntry {
                        pkgid: e.attr_string("pkgid").unwrap_or_default(),
                        name: e.attr_string("name").unwrap_or_default(),
                        arch: e.attr_string("arch").unwrap_or_default(),
                        files: Vec::new(),
                    };
                    self.read_entry(entry)
                }
                Ok(Node::Empty(e)) if e.name == "package" => {
                    Ok(FilelistsEntry {
                        pkgid: e.attr_string("pkgid").unwrap_or_default(),
                        name: e.attr_string("name").unwrap_or_default(),
                        arch: e.attr_string("arch").unwrap_or_default(),
                        files: Vec::new(),
                    })
                }
                Ok(Node::End(_) | Node::Eof) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => continue,
                Err(err) => Err(err),
            };
            if result.is_err() {
                self.done = true;
            }
            return Some(result);
        }
    }
}

pub struct FilelistsWriter {
    sink: FileSink,
}

impl FilelistsWriter {
    pub fn create<P: AsRef<Path>>(
        path: P,
        compression: CompressionType,
        package_count: usize,
    ) -> MetadataResult<Self> {
        let mut sink = FileSink::create(path, compression)?;
        let count = package_count.to_string();
        sink.start(
            "filelists",
            &[("xmlns", XML_FILELISTS_NS), ("packages", &count)],
        )?;
        Ok(Self { sink })
    }

    pub fn add_package(&mut self, pkg: &Package) -> MetadataResult<()> {
        self.sink.start(
            "package",
            &[("pkgid", &pkg.pkgid), ("name", &pkg.name), ("arch", &pkg.arch)],
        )?;
        write_version(&mut self.sink, pkg)?;
        for file in &pkg.files {
            match &file.file_type {
                Some(file_type) => {
                    self.sink
                        .text_element("file", &[("type", file_type)], &file.path)?
                }
                None => self.sink.text_element("file", &[], &file.path)?,
            }
        }
        self.sink.end("package")
    }

    pub fn finish(mut self) -> MetadataResult<()> {
        self.sink.end("filelists")?;
        self.sink.finish()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::primary::tests::sample_package;

    #[test]
    fn test_filelists_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("filelists.xml.xz");
        let pkg = sample_package("foo", "aaa");

        let mut writer = FilelistsWriter::create(&path, CompressionType::Xz, 1).unwrap();
        writer.add_package(&pkg).unwrap();
        writer.finish().unwrap();

        let entries: Vec<FilelistsEntry> = FilelistsReader::open(&path)
            .unwrap()
            .collect::<MetadataResult<_>>()
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].pkgid, "aaa");
        assert_eq!(entries[0].name, "foo");
        assert_eq!(entries[0].files, pkg.files);
    }

    #[test]
    fn test_filelists_empty_package() {
        let xml = concat!(
            r#"<filelists packages="1">"#,
            r#"<package pkgid="x" name="n" arch="noarch"/></filelists>"#
        );
        let entries: Vec<FilelistsEntry> =
            FilelistsReader::from_source(XmlSource::from_reader(xml.as_bytes()))
                .unwrap()
                .collect::<MetadataResult<_>>()
                .unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].files.is_empty());
    }
}
