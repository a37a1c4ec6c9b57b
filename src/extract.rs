//! Value extraction from responses: JSON path, XPath over XML or HTML,
//! regular expressions, headers and cookies.

use crate::cookie::ResponseCookie;
use crate::value::Value;
use regex::Regex;
use scraper::{ElementRef, Html, Node as HtmlNode};
use std::collections::BTreeMap;
use sxd_document::dom;
use sxd_document::Package;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExtractError {
    #[error("body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("json path '{0}' not found")]
    JsonPathNotFound(String),
    #[error("body is not valid XML: {0}")]
    InvalidXml(String),
    #[error("invalid xpath '{path}': {reason}")]
    InvalidXPath { path: String, reason: String },
    #[error("xpath '{0}' matched nothing")]
    NoXPathMatch(String),
    #[error("invalid regex '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },
    #[error("regex '{0}' matched nothing")]
    NoRegexMatch(String),
    #[error("header '{0}' not found")]
    HeaderNotFound(String),
    #[error("cookie '{0}' not found")]
    CookieNotFound(String),
    #[error("cookie field '{0}' is unknown")]
    UnknownCookieField(String),
}

/// Look up a dotted path (`employees.0.name`) in a JSON body and return the
/// typed value found there.
pub fn json_path(body: &str, path: &str) -> Result<Value, ExtractError> {
    let json: serde_json::Value =
        serde_json::from_str(body).map_err(|e| ExtractError::InvalidJson(e.to_string()))?;
    get_by_json_path(&json, path)
        .map(|v| Value::from_json(v.clone()))
        .ok_or_else(|| ExtractError::JsonPathNotFound(path.to_string()))
}

/// Walk `path` through objects (by key) and arrays (by numeric index).
pub fn get_by_json_path<'a>(json: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = json;
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        current = match current {
            serde_json::Value::Object(map) => map.get(part)?,
            serde_json::Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Evaluate an XPath over an XML document and return the text of the first
/// match.
pub fn xml_path(body: &str, xpath: &str) -> Result<Value, ExtractError> {
    let package = sxd_document::parser::parse(body)
        .map_err(|e| ExtractError::InvalidXml(format!("{e:?}")))?;
    first_xpath_match(&package, xpath)
}

/// Evaluate an XPath over an HTML document. The document is parsed
/// leniently and rebuilt as an XML tree so the same XPath engine applies.
pub fn html_path(body: &str, xpath: &str) -> Result<Value, ExtractError> {
    let html = Html::parse_document(body);
    let package = Package::new();
    {
        let doc = package.as_document();
        let source = html.root_element();
        let top = copy_element(&doc, source);
        doc.root().append_child(top);
        copy_children(&doc, source, top);
    }
    first_xpath_match(&package, xpath)
}

fn copy_element<'d>(doc: &dom::Document<'d>, source: ElementRef<'_>) -> dom::Element<'d> {
    let el = doc.create_element(source.value().name());
    for (name, value) in source.value().attrs() {
        el.set_attribute_value(name, value);
    }
    el
}

/// Copy the subtree under `source` into `target`. Walks with an explicit
/// stack so deeply nested documents cannot exhaust the thread stack.
fn copy_children<'d>(doc: &dom::Document<'d>, source: ElementRef<'_>, target: dom::Element<'d>) {
    let mut pending = vec![(source, target)];
    while let Some((source, target)) = pending.pop() {
        for child in source.children() {
            if let Some(child_el) = ElementRef::wrap(child) {
                let el = copy_element(doc, child_el);
                target.append_child(el);
                pending.push((child_el, el));
            } else if let HtmlNode::Text(text) = child.value() {
                target.append_child(doc.create_text(text));
            }
        }
    }
}

fn first_xpath_match(package: &Package, xpath: &str) -> Result<Value, ExtractError> {
    let doc = package.as_document();
    let value = sxd_xpath::evaluate_xpath(&doc, xpath).map_err(|e| ExtractError::InvalidXPath {
        path: xpath.to_string(),
        reason: format!("{e:?}"),
    })?;
    match value {
        sxd_xpath::Value::Nodeset(nodes) => nodes
            .document_order_first()
            .map(|node| Value::String(node.string_value()))
            .ok_or_else(|| ExtractError::NoXPathMatch(xpath.to_string())),
        sxd_xpath::Value::String(s) => Ok(Value::String(s)),
        sxd_xpath::Value::Number(n) => Ok(Value::Float(n)),
        sxd_xpath::Value::Boolean(b) => Ok(Value::Bool(b)),
    }
}

/// A regular expression compiled once when the plan is built.
#[derive(Debug, Clone)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(pattern: &str) -> Result<Self, ExtractError> {
        Regex::new(pattern)
            .map(Self)
            .map_err(|e| ExtractError::InvalidRegex {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Return the whole match at `match_no` (0-based), or the first match
    /// when the index is out of range.
    pub fn find(&self, text: &str, match_no: usize) -> Result<Value, ExtractError> {
        let matches: Vec<&str> = self.0.find_iter(text).map(|m| m.as_str()).collect();
        matches
            .get(match_no)
            .or_else(|| matches.first())
            .map(|m| Value::String((*m).to_string()))
            .ok_or_else(|| ExtractError::NoRegexMatch(self.as_str().to_string()))
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for Pattern {}

/// Case-insensitive header lookup.
pub fn header(headers: &BTreeMap<String, String>, key: &str) -> Result<Value, ExtractError> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .map(|(_, value)| Value::String(value.clone()))
        .ok_or_else(|| ExtractError::HeaderNotFound(key.to_string()))
}

/// Find a response cookie by name; `field` selects one attribute, the
/// value otherwise.
pub fn cookie(
    cookies: &[ResponseCookie],
    name: &str,
    field: Option<&str>,
) -> Result<Value, ExtractError> {
    let found = cookies
        .iter()
        .rev()
        .find(|c| c.name == name)
        .ok_or_else(|| ExtractError::CookieNotFound(name.to_string()))?;
    match field {
        None => Ok(Value::String(found.value.clone())),
        Some(field) => found
            .field(field)
            .ok_or_else(|| ExtractError::UnknownCookieField(field.to_string())),
    }
}
