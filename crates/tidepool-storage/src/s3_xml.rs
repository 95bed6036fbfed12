//! Just enough XML for S3: building request bodies and picking elements out of responses.

use tidepool_io::{StorageError, StorageResult};

/// Streaming XML writer.
#[derive(Debug, Default)]
pub struct XmlBuilder {
    buf: String,
}

impl XmlBuilder {
    /// Empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// XML declaration.
    pub fn header(&mut self) -> &mut Self {
        self.buf.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
        self
    }

    /// Opening tag.
    pub fn open(&mut self, tag: &str) -> &mut Self {
        self.buf.push('<');
        self.buf.push_str(tag);
        self.buf.push('>');
        self
    }

    /// Closing tag.
    pub fn close(&mut self, tag: &str) -> &mut Self {
        self.buf.push_str("</");
        self.buf.push_str(tag);
        self.buf.push('>');
        self
    }

    /// Element with escaped text content.
    pub fn elem(&mut self, tag: &str, value: &str) -> &mut Self {
        self.open(tag);
        self.buf.push_str(&escape(value));
        self.close(tag)
    }

    /// Element with a numeric value.
    pub fn elem_u64(&mut self, tag: &str, value: u64) -> &mut Self {
        self.elem(tag, &value.to_string())
    }

    /// The document.
    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.buf)
    }
}

/// Escape text content.
pub fn escape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => result.push_str("&amp;"),
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '"' => result.push_str("&quot;"),
            '\'' => result.push_str("&apos;"),
            _ => result.push(c),
        }
    }
    result
}

/// Reverse [`escape`], including numeric character references.
pub fn unescape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find('&') {
        result.push_str(&rest[..start]);
        let tail = &rest[start..];
        let Some(end) = tail.find(';') else {
            result.push_str(tail);
            return result;
        };
        let entity = &tail[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => result.push(c),
            None => result.push_str(&tail[..=end]),
        }
        rest = &tail[end + 1..];
    }
    result.push_str(rest);
    result
}

/// Raw inner text of every `<tag>...</tag>` at any depth, in document order.
pub fn elements<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut result = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after_tag = &rest[start..];
        // "<Key" must not match "<KeyCount"
        match after_tag.as_bytes().get(open.len()) {
            Some(b'>') | Some(b' ') | Some(b'/') => {}
            _ => {
                rest = &after_tag[open.len()..];
                continue;
            }
        }
        let Some(tag_end) = after_tag.find('>') else {
            break;
        };
        if after_tag[..tag_end].ends_with('/') {
            result.push("");
            rest = &after_tag[tag_end + 1..];
            continue;
        }
        let content = &after_tag[tag_end + 1..];
        let Some(end) = content.find(&close) else {
            break;
        };
        result.push(&content[..end]);
        rest = &content[end + close.len()..];
    }
    result
}

/// Unescaped text of the first `<tag>` element.
pub fn element(xml: &str, tag: &str) -> Option<String> {
    elements(xml, tag).first().map(|s| unescape(s))
}

/// Unescaped text of the first `<tag>` element, failing when it is absent.
pub fn required(xml: &str, tag: &str, context: &str) -> StorageResult<String> {
    element(xml, tag).ok_or_else(|| {
        StorageError::Format(format!("{}: element '{}' not found in response", context, tag))
    })
}
