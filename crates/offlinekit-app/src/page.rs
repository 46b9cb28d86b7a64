//! The host page: parsed once, queried for the mount element.

use html5ever::parse_document;
use html5ever::tendril::TendrilSink;
use markup5ever_rcdom::{Handle, NodeData, RcDom};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur while loading the page.
#[derive(Error, Debug)]
pub enum PageError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An element of the page, detached from the parse tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageElement {
    pub tag_name: String,
    pub attributes: HashMap<String, String>,
}

impl PageElement {
    /// Get an attribute value.
    pub fn get_attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(|s| s.as_str())
    }

    /// The element's `id`, if any.
    pub fn id(&self) -> Option<&str> {
        self.get_attribute("id")
    }
}

/// A parsed HTML page.
#[derive(Debug, Default)]
pub struct PageDocument {
    elements: Vec<PageElement>,
    elements_by_id: HashMap<String, usize>,
    title: Option<String>,
}

impl PageDocument {
    /// Parse an HTML document.
    pub fn parse_html(html: &str) -> Result<Self, PageError> {
        debug!(len = html.len(), "Parsing page");

        let dom = parse_document(RcDom::default(), Default::default())
            .from_utf8()
            .read_from(&mut html.as_bytes())
            .map_err(|e| PageError::Parse(e.to_string()))?;

        let mut doc = PageDocument::default();
        doc.collect(&dom.document);

        debug!(elements = doc.elements.len(), ids = doc.elements_by_id.len(), "Page parsed");
        Ok(doc)
    }

    /// Read and parse an HTML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PageError> {
        let html = std::fs::read_to_string(path.as_ref())?;
        Self::parse_html(&html)
    }

    fn collect(&mut self, handle: &Handle) {
        for child in handle.children.borrow().iter() {
            if let NodeData::Element { name, attrs, .. } = &child.data {
                let attributes: HashMap<String, String> = attrs
                    .borrow()
                    .iter()
                    .map(|a| (a.name.local.to_string(), a.value.to_string()))
                    .collect();
                let tag_name = name.local.to_string();

                if tag_name == "title" && self.title.is_none() {
                    self.title = Some(text_content(child).trim().to_string());
                }

                let index = self.elements.len();
                // first element wins for duplicate ids, as getElementById does
                if let Some(id) = attributes.get("id") {
                    self.elements_by_id.entry(id.clone()).or_insert(index);
                }
                self.elements.push(PageElement {
                    tag_name,
                    attributes,
                });
            }
            self.collect(child);
        }
    }

    /// Look up an element by its `id` attribute.
    pub fn element_by_id(&self, id: &str) -> Option<&PageElement> {
        self.elements_by_id
            .get(id)
            .and_then(|&index| self.elements.get(index))
    }

    /// Text of the first `<title>`.
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }
}

fn text_content(handle: &Handle) -> String {
    let mut result = String::new();
    collect_text(handle, &mut result);
    result
}

fn collect_text(handle: &Handle, result: &mut String) {
    match &handle.data {
        NodeData::Text { contents } => result.push_str(&contents.borrow()),
        _ => {
            for child in handle.children.borrow().iter() {
                collect_text(child, result);
            }
        }
    }
}
