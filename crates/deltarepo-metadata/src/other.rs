use std::{
    io::{BufRead, BufReader, Read},
    path::Path,
};

use deltarepo_utils::compression::CompressionType;

use crate::{
    error::{MetadataError, MetadataResult},
    package::{Changelog, Package},
    primary::write_version,
    xml::{FileSink, Node, XmlSource},
    XML_OTHER_NS,
};

/// The changelogs of one package from `other.xml`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OtherEntry {
    pub pkgid: String,
    pub name: String,
    pub arch: String,
    pub changelogs: Vec<Changelog>,
}

pub struct OtherReader<R> {
    source: XmlSource<R>,
    done: bool,
}

impl OtherReader<BufReader<Box<dyn Read>>> {
    pub fn open<P: AsRef<Path>>(path: P) -> MetadataResult<Self> {
        Self::from_source(XmlSource::open(path)?)
    }
}

impl<R: BufRead> OtherReader<R> {
    pub fn from_source(mut source: XmlSource<R>) -> MetadataResult<Self> {
        let (_, has_content) = source.expect_root("otherdata")?;
        Ok(Self {
            source,
            done: !has_content,
        })
    }

    fn read_entry(&mut self, mut entry: OtherEntry) -> MetadataResult<OtherEntry> {
        loop {
            match self.source.next_node()? {
                Node::Start(e) if e.name == "changelog" => {
                    let text = self.source.read_text("changelog")?;
                    entry.changelogs.push(Changelog {
                        author: e.attr_string("author").unwrap_or_default(),
                        date: e.parse_attr("date")?.unwrap_or(0),
                        text,
                    });
                }
                Node::Empty(e) if e.name == "changelog" => {
                    entry.changelogs.push(Changelog {
                        author: e.attr_string("author").unwrap_or_default(),
                        date: e.parse_attr("date")?.unwrap_or(0),
                        text: String::new(),
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

impl<R: BufRead> Iterator for OtherReader<R> {
    type Item = MetadataResult<OtherEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let (element, has_content) = match self.source.next_node() {
                Ok(Node::Start(e)) if e.name == "package" => (e, true),
                Ok(Node::Empty(e)) if e.name == "package" => (e, false),
                Ok(Node::End(_) | Node::Eof) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => continue,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };
            let entry = OtherEntry {
                pkgid: element.attr_string("pkgid").unwrap_or_default(),
                name: element.attr_string("name").unwrap_or_default(),
                arch: element.attr_string("arch").unwrap_or_default(),
                changelogs: Vec::new(),
            };
            if !has_content {
                return Some(Ok(entry));
            }
            let result = self.read_entry(entry);
            if result.is_err() {
                self.done = true;
            }
            return Some(result);
        }
    }
}

pub struct OtherWriter {
    sink: FileSink,
}

impl OtherWriter {
    pub fn create<P: AsRef<Path>>(
        path: P,
        compression: CompressionType,
        package_count: usize,
    ) -> MetadataResult<Self> {
        let mut sink = FileSink::create(path, compression)?;
        let count = package_count.to_string();
        sink.start("otherdata", &[("xmlns", XML_OTHER_NS), ("packages", &count)])?;
        Ok(Self { sink })
    }

    pub fn add_package(&mut self, pkg: &Package) -> MetadataResult<()> {
        self.sink.start(
            "package",
            &[("pkgid", &pkg.pkgid), ("name", &pkg.name), ("arch", &pkg.arch)],
        )?;
        write_version(&mut self.sink, pkg)?;
        for changelog in &pkg.changelogs {
            let date = changelog.date.to_string();
            self.sink.text_element(
                "changelog",
                &[("author", &changelog.author), ("date", &date)],
                &changelog.text,
            )?;
        }
        self.sink.end("package")
    }

    pub fn finish(mut self) -> MetadataResult<()> {
        self.sink.end("otherdata")?;
        self.sink.finish()
    }
}
