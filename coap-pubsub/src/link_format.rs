// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Mechanisms and constants for encoding and decoding [IETF-RFC6690 CoAP link-formats].
//!
//! [IETF-RFC6690 CoAP link-formats]: https://tools.ietf.org/html/rfc6690

use std::borrow::Cow;
use std::fmt::{Display, Write};
use std::iter::FusedIterator;

/// Resource Type Attribute.
///
/// The Resource Type `rt` attribute is an opaque string used to assign
/// an application-specific semantic type to a resource; the pub/sub
/// extension uses `core.ps.coll`, `core.ps.conf`, and `core.ps.data`.
///
/// * <a href="https://tools.ietf.org/html/rfc6690#section-3.1">RFC6690, Section 3.1</a>
pub const LINK_ATTR_RESOURCE_TYPE: &str = "rt";

/// Interface Description Attribute.
///
/// An opaque string naming a specific interface definition used to interact
/// with the target resource.
///
/// * <a href="https://tools.ietf.org/html/rfc6690#section-3.2">RFC6690, Section 3.2</a>
pub const LINK_ATTR_INTERFACE_DESCRIPTION: &str = "if";

/// Content-Format Code(s).
///
/// Space-separated list of content format integers appropriate for being
/// specified in an Accept option.
///
/// * <a href="https://tools.ietf.org/html/rfc7252#section-7.2.1">RFC7252, Section 7.2.1</a>
pub const LINK_ATTR_CONTENT_FORMAT: &str = "ct";

/// Human-readable label describing the resource.
pub const LINK_ATTR_TITLE: &str = "title";

/// Identifies this resource as observable if present.
///
/// * <a href="https://tools.ietf.org/html/rfc7641#section-6">RFC7641, Section 6</a>
pub const LINK_ATTR_OBSERVABLE: &str = "obs";

/// The estimated maximum size of the fetched resource.
///
/// * <a href="https://tools.ietf.org/html/rfc6690#section-3.3">RFC6690, Section 3.3</a>
pub const LINK_ATTR_MAXIMUM_SIZE_ESTIMATE: &str = "sz";

/// Error type for parsing a link format.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorLinkFormat {
    /// An error was encountered while parsing the link format.
    ParseError,
}

impl From<ErrorLinkFormat> for crate::Error {
    fn from(_: ErrorLinkFormat) -> Self {
        crate::Error::ParseFailure
    }
}

const QUOTE_ESCAPE_CHAR: char = '\\';
const ATTR_SEPARATOR_CHAR: char = ';';
const LINK_SEPARATOR_CHAR: char = ',';

/// Parsing iterator which parses a string formatted as an [IETF-RFC6690 CoAP link-format].
///
/// As successful parsing is performed, this iterator emits a tuple inside of a
/// `Result::Ok`. The tuple contains a string slice for the link and a
/// [`LinkAttributeParser`] to provide access to the link attributes for that link.
///
/// [IETF-RFC6690 CoAP link-format]: https://tools.ietf.org/html/rfc6690
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LinkFormatParser<'a> {
    inner: &'a str,
}

impl<'a> LinkFormatParser<'a> {
    /// Creates a new instance of `LinkFormatParser` for the given string slice.
    pub fn new(inner: &'a str) -> LinkFormatParser<'a> {
        LinkFormatParser { inner }
    }
}

impl<'a> Iterator for LinkFormatParser<'a> {
    /// (uri-ref, link-attribute-iterator)
    type Item = Result<(&'a str, LinkAttributeParser<'a>), ErrorLinkFormat>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.inner.is_empty() {
            return None;
        }

        let mut iter = self.inner.chars();

        // Proceed through whitespace until we get a '<'.
        loop {
            match iter.next() {
                Some(c) if c.is_ascii_whitespace() => continue,
                Some('<') => break,
                Some(_) => {
                    self.inner = "";
                    return Some(Err(ErrorLinkFormat::ParseError));
                }
                None => {
                    self.inner = "";
                    return None;
                }
            }
        }

        let link_ref = iter.as_str();

        // Proceed through characters until we get a '>'.
        for c in iter.by_ref() {
            if c == '>' {
                break;
            }
        }

        let link_len = link_ref.len() - iter.as_str().len();
        let link_ref = link_ref[..link_len].trim_end_matches('>');

        let mut attr_keys = iter.as_str();

        // Skip to the end of the attributes. The actual attribute parsing
        // is left to `LinkAttributeParser`.
        loop {
            match iter.next() {
                Some(LINK_SEPARATOR_CHAR) | None => {
                    break;
                }
                Some('"') => {
                    // Handle quotes.
                    loop {
                        match iter.next() {
                            Some('"') | None => break,
                            Some(QUOTE_ESCAPE_CHAR) => {
                                // Slashes always escape the next character;
                                // since this is a scan and not a parse it is
                                // just skipped.
                                iter.next();
                            }
                            _ => (),
                        }
                    }
                }
                _ => (),
            }
        }

        let attr_len = attr_keys.len() - iter.as_str().len();
        attr_keys = attr_keys[..attr_len].trim_end_matches(LINK_SEPARATOR_CHAR);

        self.inner = iter.as_str();

        Some(Ok((
            link_ref,
            LinkAttributeParser {
                inner: attr_keys.trim_matches(ATTR_SEPARATOR_CHAR),
            },
        )))
    }
}

/// Parsing iterator which parses link attributes for [IETF-RFC6690 CoAP link-format]
/// processing.
///
/// This iterator is emitted by [`LinkFormatParser`] while parsing a CoAP link-format.
/// It emits a tuple for each attribute, with the first item being a string slice for
/// the attribute key and the second item being an [`Unquote`] iterator for obtaining
/// the value.
///
/// This iterator is permissive: it makes a best effort to parse the link attributes
/// and does not emit errors while parsing.
///
/// [IETF-RFC6690 CoAP link-format]: https://tools.ietf.org/html/rfc6690
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LinkAttributeParser<'a> {
    inner: &'a str,
}

impl<'a> Iterator for LinkAttributeParser<'a> {
    /// (key_ref: &str, value-ref: Unquote)
    type Item = (&'a str, Unquote<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.inner.is_empty() {
            return None;
        }

        let mut iter = self.inner.chars();

        // Skip to the end of the attribute.
        loop {
            match iter.next() {
                Some(ATTR_SEPARATOR_CHAR) | None => {
                    break;
                }
                Some('"') => {
                    // Handle quotes.
                    loop {
                        match iter.next() {
                            Some('"') | None => {
                                break;
                            }
                            Some(QUOTE_ESCAPE_CHAR) => {
                                iter.next();
                            }
                            _ => (),
                        }
                    }
                }
                _ => (),
            }
        }

        let attr_len = self.inner.len() - iter.as_str().len();
        let attr_str = &self.inner[..attr_len];

        self.inner = iter.as_str();

        let attr_str = attr_str.trim_end_matches(ATTR_SEPARATOR_CHAR);

        let (key, value) = if let Some(i) = attr_str.find('=') {
            let (key, value) = attr_str.split_at(i);
            (key, &value[1..])
        } else {
            (attr_str, "")
        };

        Some((key.trim(), Unquote::new(value.trim())))
    }
}

/// Character iterator which decodes an [IETF-RFC2616] `quoted-string`.
/// Used by [`LinkAttributeParser`].
///
/// [IETF-RFC2616]: https://tools.ietf.org/html/rfc2616
#[derive(Clone, Debug)]
pub struct Unquote<'a> {
    inner: std::str::Chars<'a>,
    state: UnquoteState,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum UnquoteState {
    NotStarted,
    NotQuoted,
    Quoted,
}

impl<'a> Eq for Unquote<'a> {}

impl<'a> PartialEq for Unquote<'a> {
    fn eq(&self, other: &Self) -> bool {
        let self_s = self.inner.as_str();
        let other_s = other.inner.as_str();
        self.state == other.state && self_s == other_s
    }
}

impl<'a> From<Unquote<'a>> for Cow<'a, str> {
    fn from(iter: Unquote<'a>) -> Self {
        iter.to_cow()
    }
}

impl<'a> FusedIterator for Unquote<'a> {}

impl<'a> Display for Unquote<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.clone().try_for_each(|c| f.write_char(c))
    }
}

impl<'a> Unquote<'a> {
    /// Creates a new instance of the `Unquote` iterator from `quoted_str`.
    pub fn new(quoted_str: &'a str) -> Unquote<'a> {
        Unquote {
            inner: quoted_str.chars(),
            state: UnquoteState::NotStarted,
        }
    }

    /// Converts a fresh, unused instance of `Unquote` into the underlying raw
    /// string slice.
    ///
    /// Calling this method will panic if `next()` has been called.
    pub fn into_raw_str(self) -> &'a str {
        assert_eq!(self.state, UnquoteState::NotStarted);
        self.inner.as_str()
    }

    /// Returns the unquoted version of this string as a copy-on-write string.
    pub fn to_cow(&self) -> Cow<'a, str> {
        let str_ref = self.inner.as_str();
        if self.is_quoted() {
            if str_ref.find('\\').is_some() {
                Cow::from(self.to_string())
            } else {
                // String is quoted but has no escapes.
                Cow::from(&str_ref[1..str_ref.len() - 1])
            }
        } else {
            Cow::from(str_ref)
        }
    }

    /// Returns true if the underlying string is quoted, false otherwise.
    pub fn is_quoted(&self) -> bool {
        match self.state {
            UnquoteState::NotStarted => self.inner.as_str().starts_with('"'),
            UnquoteState::NotQuoted => false,
            UnquoteState::Quoted => true,
        }
    }
}

impl<'a> Iterator for Unquote<'a> {
    type Item = char;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            return match self.state {
                UnquoteState::NotStarted => match self.inner.next() {
                    Some('"') => {
                        self.state = UnquoteState::Quoted;
                        continue;
                    }
                    c => {
                        self.state = UnquoteState::NotQuoted;
                        c
                    }
                },
                UnquoteState::NotQuoted => self.inner.next(),
                UnquoteState::Quoted => match self.inner.next() {
                    Some('"') => {
                        // We are finished. Make ourselves empty so we can
                        // call ourselves "Fused".
                        self.inner = "".chars();
                        None
                    }
                    Some(QUOTE_ESCAPE_CHAR) => self.inner.next(),
                    c => c,
                },
            };
        }
    }
}

/// Helper for writing [IETF-RFC6690 CoAP link-formats] to anything implementing
/// [`core::fmt::Write`].
///
/// ## Example
///
/// ```
/// use coap_pubsub::link_format::{LinkFormatWrite, LINK_ATTR_RESOURCE_TYPE};
///
/// let mut buffer = String::new();
/// let mut write = LinkFormatWrite::new(&mut buffer);
///
/// write
///     .link("/www/topic/ps")
///     .attr_quoted(LINK_ATTR_RESOURCE_TYPE, "core.ps.coll")
///     .finish()
///     .expect("Error writing link");
///
/// assert_eq!(&buffer, r#"</www/topic/ps>;rt="core.ps.coll""#);
/// ```
///
/// [IETF-RFC6690 CoAP link-formats]: https://tools.ietf.org/html/rfc6690
#[derive(Debug)]
pub struct LinkFormatWrite<'a, T: ?Sized> {
    write: &'a mut T,
    is_first: bool,
    error: Option<core::fmt::Error>,
}

impl<'a, T: Write + ?Sized> LinkFormatWrite<'a, T> {
    /// Creates a new instance of `LinkFormatWrite` for a given instance that
    /// implements [`core::fmt::Write`].
    pub fn new(write: &'a mut T) -> LinkFormatWrite<'a, T> {
        LinkFormatWrite {
            write,
            is_first: true,
            error: None,
        }
    }

    /// Returns true if no link has been written yet.
    pub fn is_empty(&self) -> bool {
        self.is_first
    }

    /// Adds a link to the link format and returns a [`LinkAttributeWrite`],
    /// which can then be used to associate attributes with the link.
    pub fn link<'b>(&'b mut self, link: &str) -> LinkAttributeWrite<'a, 'b, T> {
        if self.is_first {
            self.is_first = false;
        } else if self.error.is_none() {
            self.error = self.write.write_char(LINK_SEPARATOR_CHAR).err();
        }

        if self.error.is_none() {
            self.error = self.write.write_char('<').err();
        }

        if self.error.is_none() {
            self.error = self.write.write_str(link).err();
        }

        if self.error.is_none() {
            self.error = self.write.write_char('>').err();
        }

        LinkAttributeWrite(self)
    }

    /// Consumes this [`LinkFormatWrite`] instance, returning any error that
    /// might have occurred during writing.
    pub fn finish(self) -> Result<(), core::fmt::Error> {
        if let Some(e) = self.error {
            Err(e)
        } else {
            Ok(())
        }
    }
}

/// Helper for writing link format attributes; created by calling
/// [`LinkFormatWrite::link`].
#[derive(Debug)]
pub struct LinkAttributeWrite<'a, 'b, T: ?Sized>(&'b mut LinkFormatWrite<'a, T>);

impl<'a, 'b, T: Write + ?Sized> LinkAttributeWrite<'a, 'b, T> {
    /// Prints just the key and an equals sign, prefixed with ';'.
    fn internal_attr_key_eq(&mut self, key: &'static str) {
        debug_assert!(key
            .find(|c: char| c.is_ascii_whitespace() || c == '=')
            .is_none());

        if self.0.error.is_none() {
            self.0.error = self.0.write.write_char(ATTR_SEPARATOR_CHAR).err();
        }

        if self.0.error.is_none() {
            self.0.error = self.0.write.write_str(key).err();
        }

        if self.0.error.is_none() {
            self.0.error = self.0.write.write_char('=').err();
        }
    }

    /// Adds an attribute to the link, only quoting the value if it contains
    /// non-ascii-alphanumeric characters.
    pub fn attr(mut self, key: &'static str, value: &str) -> Self {
        if value.find(|c: char| !c.is_ascii_alphanumeric()).is_some() {
            return self.attr_quoted(key, value);
        }

        self.internal_attr_key_eq(key);

        if self.0.error.is_none() {
            self.0.error = self.0.write.write_str(value).err();
        }

        self
    }

    /// Adds a value-less flag attribute (such as `obs`) to the link.
    pub fn attr_flag(self, key: &'static str) -> Self {
        if self.0.error.is_none() {
            self.0.error = self.0.write.write_char(ATTR_SEPARATOR_CHAR).err();
        }

        if self.0.error.is_none() {
            self.0.error = self.0.write.write_str(key).err();
        }

        self
    }

    /// Adds an attribute to the link that has a u32 value.
    pub fn attr_u32(mut self, key: &'static str, value: u32) -> Self {
        self.internal_attr_key_eq(key);

        if self.0.error.is_none() {
            self.0.error = write!(self.0.write, "{}", value).err();
        }

        self
    }

    /// Adds an attribute to the link that has a u16 value.
    pub fn attr_u16(self, key: &'static str, value: u16) -> Self {
        self.attr_u32(key, value as u32)
    }

    /// Adds an attribute to the link, unconditionally quoting the value.
    pub fn attr_quoted(mut self, key: &'static str, value: &str) -> Self {
        self.internal_attr_key_eq(key);

        if self.0.error.is_none() {
            self.0.error = self.0.write.write_char('"').err();
        }

        for c in value.chars() {
            if (c == '"' || c == '\\') && self.0.error.is_none() {
                self.0.error = self.0.write.write_char(QUOTE_ESCAPE_CHAR).err();
            }

            if self.0.error.is_none() {
                self.0.error = self.0.write.write_char(c).err();
            }
        }

        if self.0.error.is_none() {
            self.0.error = self.0.write.write_char('"').err();
        }

        self
    }

    /// Consumes this [`LinkAttributeWrite`] instance, returning any error that
    /// might have occurred during writing.
    pub fn finish(self) -> Result<(), core::fmt::Error> {
        if let Some(e) = self.0.error {
            Err(e)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn link_format_write() {
        let mut buffer = String::new();

        let mut write = LinkFormatWrite::new(&mut buffer);

        write
            .link("/www/topic/ps")
            .attr_quoted(LINK_ATTR_RESOURCE_TYPE, "core.ps.coll")
            .attr_u16(LINK_ATTR_CONTENT_FORMAT, 40)
            .finish()
            .expect("Write link failed");

        write
            .link("/www/topic/ps/weather")
            .attr_quoted(LINK_ATTR_RESOURCE_TYPE, "core.ps.data")
            .attr_flag(LINK_ATTR_OBSERVABLE)
            .finish()
            .expect("Write link failed");

        assert_eq!(write.finish(), Ok(()));

        assert_eq!(
            &buffer,
            r#"</www/topic/ps>;rt="core.ps.coll";ct=40,</www/topic/ps/weather>;rt="core.ps.data";obs"#
        );
    }

    #[test]
    fn unquote() {
        assert_eq!(&Unquote::new(r#""sensor""#).to_string(), "sensor");
        assert_eq!(&Unquote::new("sensor").to_string(), "sensor");
        assert_eq!(
            &Unquote::new(r#""the \"foo\" bar""#).to_string(),
            r#"the "foo" bar"#
        );
    }

    #[test]
    fn link_format_parser() {
        let link_format = r#"</sensors>;ct=40;title="Sensor Index",
   </sensors/temp>;rt="temperature-c";if="sensor""#;

        let mut parser = LinkFormatParser::new(link_format);

        let (link, mut attr_iter) = parser.next().unwrap().unwrap();
        assert_eq!(link, "/sensors");
        assert_eq!(
            attr_iter.next().map(|attr| (attr.0, attr.1.into_raw_str())),
            Some(("ct", "40"))
        );
        assert_eq!(
            attr_iter.next().map(|attr| (attr.0, attr.1.into_raw_str())),
            Some(("title", r#""Sensor Index""#))
        );
        assert_eq!(attr_iter.next(), None);

        let (link, mut attr_iter) = parser.next().unwrap().unwrap();
        assert_eq!(link, "/sensors/temp");
        assert_eq!(
            attr_iter.next().map(|attr| (attr.0, attr.1.to_cow())),
            Some(("rt", Cow::from("temperature-c")))
        );
        assert_eq!(
            attr_iter.next().map(|attr| (attr.0, attr.1.to_cow())),
            Some(("if", Cow::from("sensor")))
        );
        assert_eq!(attr_iter.next(), None);

        assert_eq!(parser.next(), None);
    }

    #[test]
    fn flag_attribute_parses_with_empty_value() {
        let link_format = r#"</t>;obs;rt="core.ps.data""#;
        let mut parser = LinkFormatParser::new(link_format);
        let (link, mut attr_iter) = parser.next().unwrap().unwrap();
        assert_eq!(link, "/t");
        assert_eq!(
            attr_iter.next().map(|attr| (attr.0, attr.1.into_raw_str())),
            Some(("obs", ""))
        );
    }
}
