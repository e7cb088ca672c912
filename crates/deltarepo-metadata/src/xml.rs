//! Thin pull/push layer over `quick_xml` shared by every metadata format.
//!
//! [`XmlSource`] turns the borrowed event stream into owned [`Node`]s so
//! parsers can recurse freely, [`XmlSink`] writes indented, deterministic
//! output.

use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Read, Write},
    path::Path,
    str::FromStr,
};

use deltarepo_utils::compression::{create_writer, open_reader, CompressionType, Encoder};
use quick_xml::{
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
    Reader, Writer,
};

use crate::error::{MetadataError, MetadataResult};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
}

impl Element {
    fn from_event(e: &BytesStart<'_>) -> MetadataResult<Self> {
        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attr in e.attributes() {
            let attr = attr?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            attributes.push((key, value));
        }
        Ok(Self { name, attributes })
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn attr_string(&self, key: &str) -> Option<String> {
        self.attr(key).map(str::to_string)
    }

    pub fn required_attr(&self, key: &str) -> MetadataResult<&str> {
        self.attr(key).ok_or_else(|| {
            MetadataError::MissingAttribute {
                element: self.name.clone(),
                attribute: key.to_string(),
            }
        })
    }

    /// Parses an attribute value, `Ok(None)` when it is absent.
    pub fn parse_attr<T: FromStr>(&self, key: &str) -> MetadataResult<Option<T>> {
        match self.attr(key) {
            None => Ok(None),
            Some(value) => {
                value.trim().parse().map(Some).map_err(|_| {
                    MetadataError::InvalidValue {
                        element: format!("{} {key}", self.name),
                        value: value.to_string(),
                    }
                })
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Start(Element),
    Empty(Element),
    End(String),
    Text(String),
    Eof,
}

pub struct XmlSource<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
}

impl XmlSource<BufReader<Box<dyn Read>>> {
    /// Opens a plain or compressed XML file.
    pub fn open<P: AsRef<Path>>(path: P) -> MetadataResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(MetadataError::NotFound(path.to_path_buf()));
        }
        let reader = open_reader(path)?;
        Ok(Self::from_reader(BufReader::new(reader)))
    }
}

impl<R: BufRead> XmlSource<R> {
    pub fn from_reader(reader: R) -> Self {
        let mut reader = Reader::from_reader(reader);
        reader.config_mut().trim_text(true);
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    pub fn next_node(&mut self) -> MetadataResult<Node> {
        loop {
            self.buf.clear();
            let node = match self.reader.read_event_into(&mut self.buf)? {
                Event::Start(e) => Node::Start(Element::from_event(&e)?),
                Event::Empty(e) => Node::Empty(Element::from_event(&e)?),
                Event::End(e) => Node::End(String::from_utf8_lossy(e.name().as_ref()).into_owned()),
                Event::Text(e) => Node::Text(e.unescape()?.into_owned()),
                Event::CData(e) => Node::Text(String::from_utf8_lossy(&e).into_owned()),
                Event::Eof => Node::Eof,
                _ => continue,
            };
            return Ok(node);
        }
    }

    /// Reads up to the first element and checks its name.
    ///
    /// Returns the root and whether it has content (`false` for `<root/>`).
    pub fn expect_root(&mut self, name: &str) -> MetadataResult<(Element, bool)> {
        loop {
            let (element, has_content) = match self.next_node()? {
                Node::Start(e) => (e, true),
                Node::Empty(e) => (e, false),
                Node::Eof => {
                    return Err(MetadataError::UnexpectedEof {
                        element: name.to_string(),
                    })
                }
                _ => continue,
            };
            if element.name != name {
                return Err(MetadataError::UnexpectedRoot {
                    expected: name.to_string(),
                    found: element.name,
                });
            }
            return Ok((element, has_content));
        }
    }

    /// Collects the text of the element whose start tag was just consumed.
    pub fn read_text(&mut self, element: &str) -> MetadataResult<String> {
        let mut text = String::new();
        let mut depth = 0usize;
        loop {
            match self.next_node()? {
                Node::Text(t) if depth == 0 => text.push_str(&t),
                Node::Start(_) => depth += 1,
                Node::End(_) if depth == 0 => return Ok(text),
                Node::End(_) => depth -= 1,
                Node::Eof => {
                    return Err(MetadataError::UnexpectedEof {
                        element: element.to_string(),
                    })
                }
                _ => {}
            }
        }
    }

    /// Skips the rest of the element whose start tag was just consumed.
    pub fn skip_element(&mut self, element: &str) -> MetadataResult<()> {
        self.read_text(element).map(|_| ())
    }
}

pub struct XmlSink<W: Write> {
    writer: Writer<W>,
}

impl<W: Write> XmlSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: Writer::new_with_indent(inner, b' ', 2),
        }
    }

    pub fn declaration(&mut self) -> MetadataResult<()> {
        self.writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        Ok(())
    }

    pub fn start(&mut self, name: &str, attrs: &[(&str, &str)]) -> MetadataResult<()> {
        let elem = BytesStart::new(name).with_attributes(attrs.iter().copied());
        self.writer.write_event(Event::Start(elem))?;
        Ok(())
    }

    pub fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) -> MetadataResult<()> {
        let elem = BytesStart::new(name).with_attributes(attrs.iter().copied());
        self.writer.write_event(Event::Empty(elem))?;
        Ok(())
    }

    pub fn end(&mut self, name: &str) -> MetadataResult<()> {
        self.writer.write_event(Event::End(BytesEnd::new(name)))?;
        Ok(())
    }

    pub fn text_element(
        &mut self,
        name: &str,
        attrs: &[(&str, &str)],
        text: &str,
    ) -> MetadataResult<()> {
        self.start(name, attrs)?;
        self.writer.write_event(Event::Text(BytesText::new(text)))?;
        self.end(name)
    }

    /// Ends the document with a trailing newline and returns the writer.
    pub fn into_inner(self) -> MetadataResult<W> {
        let mut inner = self.writer.into_inner();
        inner.write_all(b"\n")?;
        Ok(inner)
    }
}

/// A sink writing into a (possibly compressed) file.
pub type FileSink = XmlSink<Encoder<BufWriter<File>>>;

impl FileSink {
    pub fn create<P: AsRef<Path>>(path: P, compression: CompressionType) -> MetadataResult<Self> {
        let encoder = create_writer(path, compression)?;
        let mut sink = XmlSink::new(encoder);
        sink.declaration()?;
        Ok(sink)
    }

    pub fn finish(self) -> MetadataResult<()> {
        let encoder = self.into_inner()?;
        encoder.finish()?.flush()?;
        Ok(())
    }
}

/// Renders a document into memory, used for small descriptors.
pub fn render<F>(build: F) -> MetadataResult<Vec<u8>>
where
    F: FnOnce(&mut XmlSink<Vec<u8>>) -> MetadataResult<()>,
{
    let mut sink = XmlSink::new(Vec::new());
    sink.declaration()?;
    build(&mut sink)?;
    sink.into_inner()
}

/// Writes `data` to `path`, compressing according to the file suffix.
pub fn write_by_suffix<P: AsRef<Path>>(path: P, data: &[u8]) -> MetadataResult<()> {
    let path = path.as_ref();
    let mut encoder = create_writer(path, CompressionType::from_path(path))?;
    encoder.write_all(data)?;
    encoder.finish()?.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(xml: &str) -> XmlSource<&[u8]> {
        XmlSource::from_reader(xml.as_bytes())
    }

    #[test]
    fn test_expect_root() {
        let mut src = source(r#"<?xml version="1.0"?><removed><packages/></removed>"#);
        let (root, has_content) = src.expect_root("removed").unwrap();
        assert_eq!(root.name, "removed");
        assert!(has_content);

        let mut src = source("<other/>");
        assert!(matches!(
            src.expect_root("removed"),
            Err(MetadataError::UnexpectedRoot { .. })
        ));
    }

    #[test]
    fn test_read_text_unescapes() {
        let mut src = source("<a><b>x &amp; y</b></a>");
        src.expect_root("a").unwrap();
        match src.next_node().unwrap() {
            Node::Start(e) => assert_eq!(e.name, "b"),
            other => panic!("unexpected node {other:?}"),
        }
        assert_eq!(src.read_text("b").unwrap(), "x & y");
    }

    #[test]
    fn test_skip_nested_element() {
        let mut src = source("<a><skip><x>1</x><y/></skip><keep>2</keep></a>");
        src.expect_root("a").unwrap();
        src.next_node().unwrap();
        src.skip_element("skip").unwrap();
        assert!(matches!(src.next_node().unwrap(), Node::Start(e) if e.name == "keep"));
    }

    #[test]
    fn test_attributes() {
        let mut src = source(r#"<a><v epoch="1" ver="2&lt;3" bad="x"/></a>"#);
        src.expect_root("a").unwrap();
        let Node::Empty(e) = src.next_node().unwrap() else {
            panic!("expected empty element");
        };
        assert_eq!(e.attr("ver"), Some("2<3"));
        assert_eq!(e.parse_attr::<u32>("epoch").unwrap(), Some(1));
        assert_eq!(e.parse_attr::<u32>("missing").unwrap(), None);
        assert!(e.parse_attr::<u32>("bad").is_err());
        assert!(matches!(
            e.required_attr("rel"),
            Err(MetadataError::MissingAttribute { .. })
        ));
    }

    #[test]
    fn test_sink_output() {
        let out = render(|sink| {
            sink.start("root", &[("n", "1")])?;
            sink.text_element("item", &[], "a & b")?;
            sink.empty("leaf", &[("k", "\"v\"")])?;
            sink.end("root")
        })
        .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(text.contains("<root n=\"1\">"));
        assert!(text.contains("<item>a &amp; b</item>"));
        assert!(text.contains("<leaf k=\"&quot;v&quot;\"/>"));
        assert!(text.ends_with("</root>\n"));

        let mut src = XmlSource::from_reader(text.as_bytes());
        src.expect_root("root").unwrap();
        src.next_node().unwrap();
        assert_eq!(src.read_text("item").unwrap(), "a & b");
    }
}
