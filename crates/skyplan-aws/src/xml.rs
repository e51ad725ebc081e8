//! XML helpers over quick-xml
//!
//! Typed list/result documents go through serde; single values (error codes,
//! ARNs, parameter values) are pulled out with the streaming reader.

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::de::DeserializeOwned;
use skyplan_core::{Result, SkyError};

/// Text of the first element named `tag` (local name, namespaces ignored)
pub fn first_text(xml: &str, tag: &str) -> Option<String> {
    collect_texts(xml, tag, true).into_iter().next()
}

/// Texts of every element named `tag`, in document order
pub fn all_texts(xml: &str, tag: &str) -> Vec<String> {
    collect_texts(xml, tag, false)
}

fn collect_texts(xml: &str, tag: &str, first_only: bool) -> Vec<String> {
    let mut reader = Reader::from_str(xml);
    let tag = tag.as_bytes();
    let mut found = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if depth > 0 {
                    depth += 1;
                } else if e.local_name().as_ref() == tag {
                    depth = 1;
                    current.clear();
                }
            }
            Ok(Event::Empty(e)) if depth == 0 && e.local_name().as_ref() == tag => {
                found.push(String::new());
                if first_only {
                    break;
                }
            }
            Ok(Event::Text(t)) if depth > 0 => match t.unescape() {
                Ok(text) => current.push_str(&text),
                Err(_) => current.push_str(&String::from_utf8_lossy(&t)),
            },
            Ok(Event::CData(c)) if depth > 0 => {
                current.push_str(&String::from_utf8_lossy(&c));
            }
            Ok(Event::End(_)) if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    found.push(current.trim().to_string());
                    if first_only {
                        break;
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }

    found
}

/// Deserialize a response document
pub fn from_xml<T: DeserializeOwned>(xml: &str) -> Result<T> {
    quick_xml::de::from_str(xml)
        .map_err(|e| SkyError::Serialization(format!("invalid XML response: {}", e)))
}

/// Escape text for element content
pub fn escape(text: &str) -> String {
    quick_xml::escape::escape(text).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ERROR: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ErrorResponse xmlns="https://iam.amazonaws.com/doc/2010-05-08/">
  <Error>
    <Type>Sender</Type>
    <Code>NoSuchEntity</Code>
    <Message>The role with name app-role cannot be found &amp; so on.</Message>
  </Error>
  <RequestId>abc</RequestId>
</ErrorResponse>"#;

    #[test]
    fn test_first_text() {
        assert_eq!(first_text(ERROR, "Code").as_deref(), Some("NoSuchEntity"));
        assert_eq!(
            first_text(ERROR, "Message").as_deref(),
            Some("The role with name app-role cannot be found & so on.")
        );
        assert!(first_text(ERROR, "Missing").is_none());
    }

    #[test]
    fn test_all_texts_and_empty_elements() {
        let xml = "<r><PolicyArn>a</PolicyArn><x/><PolicyArn>b</PolicyArn><LocationConstraint/></r>";
        assert_eq!(all_texts(xml, "PolicyArn"), vec!["a", "b"]);
        assert_eq!(first_text(xml, "LocationConstraint").as_deref(), Some(""));
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("a<b&c"), "a&lt;b&amp;c");
    }
}
