//! The `removed.xml` part of a delta: packages and auxiliary files present in
//! the old repository but gone from the new one.

use std::{collections::BTreeMap, io::BufRead, path::Path};

use deltarepo_metadata::{
    xml::{render, write_by_suffix, Element, Node, XmlSink, XmlSource},
    MetadataError, Package,
};

use crate::DeltaRepoResult;

/// `location_href -> location_base` for removed packages and files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovedSet {
    packages: BTreeMap<String, Option<String>>,
    files: BTreeMap<String, Option<String>>,
}

impl RemovedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_package<S: Into<String>>(&mut self, href: S, base: Option<String>) {
        self.packages.insert(href.into(), base);
    }

    pub fn add_file<S: Into<String>>(&mut self, href: S, base: Option<String>) {
        self.files.insert(href.into(), base);
    }

    /// Whether `pkg` is excluded from the new repository. Both the href and
    /// the base must match.
    pub fn contains_package(&self, pkg: &Package) -> bool {
        self.packages
            .get(&pkg.location_href)
            .is_some_and(|base| *base == pkg.location_base)
    }

    pub fn packages(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.packages.iter().map(|(h, b)| (h.as_str(), b.as_deref()))
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.files.iter().map(|(h, b)| (h.as_str(), b.as_deref()))
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty() && self.files.is_empty()
    }

    pub fn parse_file<P: AsRef<Path>>(path: P) -> DeltaRepoResult<Self> {
        Self::parse_source(XmlSource::open(path)?)
    }

    pub fn parse_source<R: BufRead>(mut source: XmlSource<R>) -> DeltaRepoResult<Self> {
        let mut removed = Self::new();
        let (_, has_content) = source.expect_root("removed")?;
        if !has_content {
            return Ok(removed);
        }

        loop {
            match source.next_node()? {
                Node::Start(e) if e.name == "packages" => {
                    read_locations(&mut source, &mut removed.packages)?
                }
                Node::Start(e) if e.name == "files" => {
                    read_locations(&mut source, &mut removed.files)?
                }
                Node::Start(e) => source.skip_element(&e.name)?,
                Node::End(_) | Node::Eof => break,
                _ => {}
            }
        }
        Ok(removed)
    }

    pub fn to_xml(&self) -> DeltaRepoResult<Vec<u8>> {
        Ok(render(|sink| {
            sink.start("removed", &[])?;
            write_locations(sink, "packages", &self.packages)?;
            write_locations(sink, "files", &self.files)?;
            sink.end("removed")
        })?)
    }

    /// Writes the set, compressed according to the suffix of `path`.
    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> DeltaRepoResult<()> {
        Ok(write_by_suffix(path, &self.to_xml()?)?)
    }
}

fn location_of(element: &Element) -> Result<(String, Option<String>), MetadataError> {
    let href = element.required_attr("href")?.to_string();
    Ok((href, element.attr_string("base")))
}

fn read_locations<R: BufRead>(
    source: &mut XmlSource<R>,
    into: &mut BTreeMap<String, Option<String>>,
) -> DeltaRepoResult<()> {
    loop {
        match source.next_node()? {
            Node::Empty(e) if e.name == "location" => {
                let (href, base) = location_of(&e)?;
                into.insert(href, base);
            }
            Node::Start(e) if e.name == "location" => {
                let (href, base) = location_of(&e)?;
                source.skip_element("location")?;
                into.insert(href, base);
            }
            Node::Start(e) => source.skip_element(&e.name)?,
            Node::End(_) | Node::Eof => return Ok(()),
            _ => {}
        }
    }
}

fn write_locations<W: std::io::Write>(
    sink: &mut XmlSink<W>,
    name: &str,
    locations: &BTreeMap<String, Option<String>>,
) -> Result<(), MetadataError> {
    if locations.is_empty() {
        return sink.empty(name, &[]);
    }
    sink.start(name, &[])?;
    for (href, base) in locations {
        match base {
            Some(base) => sink.empty("location", &[("href", href), ("base", base)])?,
            None => sink.empty("location", &[("href", href)])?,
        }
    }
    sink.end(name)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_contains_package_checks_base() {
        let mut removed = RemovedSet::new();
        removed.add_package("Packages/a.rpm", None);
        removed.add_package("Packages/b.rpm", Some("http://mirror/".to_string()));

        let a = Package {
            location_href: "Packages/a.rpm".to_string(),
            ..Default::default()
        };
        let b_local = Package {
            location_href: "Packages/b.rpm".to_string(),
            ..Default::default()
        };
        let b_remote = Package {
            location_href: "Packages/b.rpm".to_string(),
            location_base: Some("http://mirror/".to_string()),
            ..Default::default()
        };

        assert!(removed.contains_package(&a));
        assert!(!removed.contains_package(&b_local));
        assert!(removed.contains_package(&b_remote));
    }

    #[test]
    fn test_write_and_parse_compressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("removed.xml.xz");

        let mut removed = RemovedSet::new();
        removed.add_package("Packages/z.rpm", None);
        removed.add_package("Packages/a.rpm", Some("http://mirror/".to_string()));
        removed.add_file("repodata/comps.xml", None);
        removed.write_file(&path).unwrap();

        let parsed = RemovedSet::parse_file(&path).unwrap();
        assert_eq!(parsed, removed);
        let hrefs: Vec<&str> = parsed.packages().map(|(h, _)| h).collect();
        assert_eq!(hrefs, ["Packages/a.rpm", "Packages/z.rpm"]);
    }

    #[test]
    fn test_empty_set_xml() {
        let xml = String::from_utf8(RemovedSet::new().to_xml().unwrap()).unwrap();
        assert!(xml.contains("<packages/>"));
        assert!(xml.contains("<files/>"));

        let parsed = RemovedSet::parse_source(XmlSource::from_reader(xml.as_bytes())).unwrap();
        assert!(parsed.is_empty());
    }
}
