//! Streaming reader for MediaWiki `pages-articles` dump files.
//!
//! Yields one [`Page`] per `<page>` element, in document order, without ever
//! holding more than one page in memory. Only the elements the store cares
//! about are extracted; everything else in the dump is skipped.

use quick_xml::events::Event;
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

/// Errors that may occur while reading a dump.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The dump file could not be opened or read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The dump was not the XML this reader understands.
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// A `<page>` was missing a required child element.
    #[error("malformed <page>: missing {0}")]
    MissingElement(&'static str),
}

/// One page extracted from a dump.
#[derive(Clone, Debug)]
pub struct Page {
    /// The content model of the revision. Defaults to `wikitext` for old
    /// dumps that predate the `<model>` element.
    pub model: String,
    /// The numeric namespace of the page.
    pub namespace: i64,
    /// The full page title, including any namespace prefix.
    pub title: String,
    /// The revision text.
    pub text: String,
    /// The redirect target, when the page is a redirect.
    pub redirect: Option<String>,
}

/// An iterator over the pages of a dump file.
pub struct DumpReader<R: BufRead> {
    /// The streaming XML reader.
    reader: quick_xml::reader::Reader<R>,
    /// Reused event buffer.
    buf: Vec<u8>,
}

/// Opens a dump file, transparently decompressing `.bz2`.
pub fn open(path: impl AsRef<Path>) -> Result<DumpReader<Box<dyn BufRead + Send>>, Error> {
    let path = path.as_ref();
    let file = BufReader::with_capacity(64 * 1024, File::open(path)?);

    let read: Box<dyn BufRead + Send> = if path.extension().is_some_and(|ext| ext == "bz2") {
        let decoder = bzip2_rs::DecoderReader::new(file);
        Box::new(BufReader::with_capacity(64 * 1024, decoder))
    } else {
        Box::new(file)
    };

    Ok(DumpReader::new(read))
}

impl<R: BufRead> DumpReader<R> {
    /// Creates a reader over an already-open XML stream.
    pub fn new(read: R) -> Self {
        Self {
            reader: quick_xml::reader::Reader::from_reader(read),
            buf: Vec::with_capacity(64 * 1024),
        }
    }

    /// Reads events until the next `</page>`, accumulating page fields.
    fn read_page(&mut self) -> Result<Page, Error> {
        let mut title = None;
        let mut namespace = None;
        let mut model = None;
        let mut text = None;
        let mut redirect = None;

        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf)? {
                Event::Start(start) => match start.name().as_ref() {
                    b"title" => title = Some(take_element_text(&mut self.reader, b"title")?),
                    b"ns" => {
                        namespace = take_element_text(&mut self.reader, b"ns")?
                            .trim()
                            .parse::<i64>()
                            .ok();
                    }
                    b"model" => model = Some(take_element_text(&mut self.reader, b"model")?),
                    b"text" => text = Some(take_element_text(&mut self.reader, b"text")?),
                    b"redirect" => redirect = redirect_title(&start)?,
                    _ => {}
                },
                Event::Empty(start) if start.name().as_ref() == b"redirect" => {
                    redirect = redirect_title(&start)?;
                }
                Event::End(end) if end.name().as_ref() == b"page" => break,
                Event::Eof => return Err(Error::MissingElement("</page>")),
                _ => {}
            }
        }

        Ok(Page {
            model: model.unwrap_or_else(|| "wikitext".to_string()),
            namespace: namespace.unwrap_or(0),
            title: title.ok_or(Error::MissingElement("title"))?,
            text: text.unwrap_or_default(),
            redirect,
        })
    }
}

impl<R: BufRead> Iterator for DumpReader<R> {
    type Item = Result<Page, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Start(start)) if start.name().as_ref() == b"page" => {
                    return Some(self.read_page());
                }
                Ok(Event::Eof) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}

/// Extracts the `title` attribute of a `<redirect>` element.
fn redirect_title(
    start: &quick_xml::events::BytesStart<'_>,
) -> Result<Option<String>, Error> {
    for attribute in start.attributes().with_checks(false).flatten() {
        if attribute.key.as_ref() == b"title" {
            return Ok(Some(
                attribute
                    .unescape_value()
                    .map(|value| value.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&attribute.value).into_owned()),
            ));
        }
    }
    Ok(None)
}

/// Accumulates the text content of the current element up to its end tag.
fn take_element_text<R: BufRead>(
    reader: &mut quick_xml::reader::Reader<R>,
    name: &[u8],
) -> Result<String, Error> {
    let mut buf = Vec::new();
    let mut text = String::new();
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)? {
            Event::Text(t) => text.push_str(&t.unescape()?),
            Event::CData(t) => text.push_str(&String::from_utf8_lossy(&t)),
            Event::End(end) if end.name().as_ref() == name => break,
            Event::Eof => return Err(Error::MissingElement("end tag")),
            _ => {}
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<mediawiki xmlns="http://www.mediawiki.org/xml/export-0.10/">
  <siteinfo><sitename>Test</sitename></siteinfo>
  <page>
    <title>Alpha</title>
    <ns>0</ns>
    <revision>
      <model>wikitext</model>
      <text>alpha &amp; text</text>
    </revision>
  </page>
  <page>
    <title>Template:R</title>
    <ns>10</ns>
    <redirect title="Template:T" />
    <revision>
      <text>#REDIRECT [[Template:T]]</text>
    </revision>
  </page>
</mediawiki>"#;

    #[test]
    fn test_stream_pages() {
        let pages = DumpReader::new(SAMPLE.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(pages.len(), 2);

        assert_eq!(pages[0].title, "Alpha");
        assert_eq!(pages[0].namespace, 0);
        assert_eq!(pages[0].model, "wikitext");
        assert_eq!(pages[0].text, "alpha & text", "entities are decoded");
        assert!(pages[0].redirect.is_none());

        assert_eq!(pages[1].title, "Template:R");
        assert_eq!(pages[1].namespace, 10);
        assert_eq!(
            pages[1].redirect.as_deref(),
            Some("Template:T"),
            "the redirect target comes from the attribute"
        );
    }

    #[test]
    fn test_missing_model_defaults() {
        let xml = "<x><page><title>T</title><ns>0</ns><revision><text>t</text></revision></page></x>";
        let pages = DumpReader::new(xml.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(pages[0].model, "wikitext");
    }
}
