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

//! The resource tree: a trie of path segments with one resource entry per
//! node.
//!
//! The three pub/sub resource kinds (collection, configuration, data) share
//! the node representation and are distinguished by a [`ResourceKind`] tag;
//! dispatch on the tag happens in the broker. Discovery walks the tree and
//! renders a link-format listing, filtered by `rt=`/`ct=`/`href=` queries
//! (AND-combined).

use super::link_format::{
    LinkFormatWrite, LINK_ATTR_CONTENT_FORMAT, LINK_ATTR_INTERFACE_DESCRIPTION,
    LINK_ATTR_OBSERVABLE, LINK_ATTR_RESOURCE_TYPE, LINK_ATTR_TITLE,
};
use super::message::MsgCode;

/// Identifier of a topic owned by the pub/sub manager. Stable for the
/// lifetime of the topic; never reused.
pub type TopicId = usize;

/// Tag distinguishing what a resource node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// The `/.well-known/core` discovery resource.
    WellKnownCore,

    /// A topic collection resource (`rt="core.ps.coll"`).
    TopicCollection,

    /// A topic configuration resource (`rt="core.ps.conf"`).
    TopicConfig(TopicId),

    /// A topic data resource (`rt="core.ps.data"`).
    TopicData(TopicId),
}

/// Link-format attributes attached to a resource.
#[derive(Debug, Clone, Default)]
pub struct ResourceAttrs {
    /// `rt` attribute.
    pub resource_type: Option<String>,

    /// `if` attribute.
    pub interface: Option<String>,

    /// `ct` attribute.
    pub content_format: Option<u16>,

    /// `title` attribute.
    pub title: Option<String>,

    /// `obs` flag.
    pub observable: bool,
}

/// Set of methods a resource accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodSet(u8);

impl MethodSet {
    const GET: u8 = 1 << 0;
    const POST: u8 = 1 << 1;
    const PUT: u8 = 1 << 2;
    const DELETE: u8 = 1 << 3;
    const FETCH: u8 = 1 << 4;
    const IPATCH: u8 = 1 << 5;

    /// An empty method set.
    pub fn none() -> MethodSet {
        MethodSet(0)
    }

    /// Adds a method to the set.
    pub fn with(mut self, code: MsgCode) -> MethodSet {
        self.0 |= Self::bit(code);
        self
    }

    /// Returns true if `code` is a member of this set.
    pub fn contains(&self, code: MsgCode) -> bool {
        let bit = Self::bit(code);
        bit != 0 && self.0 & bit == bit
    }

    fn bit(code: MsgCode) -> u8 {
        match code {
            MsgCode::MethodGet => Self::GET,
            MsgCode::MethodPost => Self::POST,
            MsgCode::MethodPut => Self::PUT,
            MsgCode::MethodDelete => Self::DELETE,
            MsgCode::MethodFetch => Self::FETCH,
            MsgCode::MethodIPatch => Self::IPATCH,
            _ => 0,
        }
    }
}

/// The registration record stored at a node.
#[derive(Debug, Clone)]
pub struct ResourceEntry {
    /// What kind of resource this is.
    pub kind: ResourceKind,

    /// Discovery attributes.
    pub attrs: ResourceAttrs,

    /// Methods the resource accepts.
    pub methods: MethodSet,
}

#[derive(Debug)]
struct Node {
    segment: String,
    entry: Option<ResourceEntry>,
    children: Vec<Node>,
}

impl Node {
    fn new(segment: &str) -> Node {
        Node {
            segment: segment.to_string(),
            entry: None,
            children: Vec::new(),
        }
    }

    fn child_mut(&mut self, segment: &str) -> Option<&mut Node> {
        self.children
            .iter_mut()
            .find(|child| child.segment == segment)
    }

    fn child(&self, segment: &str) -> Option<&Node> {
        self.children.iter().find(|child| child.segment == segment)
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

/// Hierarchical map of URI paths to resource entries.
#[derive(Debug)]
pub struct ResourceTree {
    root: Node,
}

impl ResourceTree {
    /// Creates a tree containing only `/.well-known/core`.
    pub fn new() -> ResourceTree {
        let mut tree = ResourceTree {
            root: Node::new(""),
        };

        tree.insert(
            super::consts::WELL_KNOWN_CORE_PATH,
            ResourceEntry {
                kind: ResourceKind::WellKnownCore,
                attrs: ResourceAttrs {
                    content_format: Some(
                        super::ContentFormat::APPLICATION_LINK_FORMAT.0,
                    ),
                    ..Default::default()
                },
                methods: MethodSet::none().with(MsgCode::MethodGet),
            },
        );

        tree
    }

    /// Registers (or replaces) the resource at `path`.
    pub fn insert(&mut self, path: &str, entry: ResourceEntry) {
        let mut node = &mut self.root;

        for segment in split_path(path) {
            if node.child_mut(segment).is_none() {
                node.children.push(Node::new(segment));
            }
            node = node.child_mut(segment).unwrap();
        }

        node.entry = Some(entry);
    }

    /// Removes the resource at `path`, pruning branches that become empty.
    pub fn remove(&mut self, path: &str) -> Option<ResourceEntry> {
        let segments: Vec<&str> = split_path(path).collect();
        Self::remove_recursive(&mut self.root, &segments)
    }

    fn remove_recursive(node: &mut Node, segments: &[&str]) -> Option<ResourceEntry> {
        match segments.split_first() {
            None => node.entry.take(),
            Some((head, rest)) => {
                let index = node
                    .children
                    .iter()
                    .position(|child| child.segment == *head)?;
                let removed = Self::remove_recursive(&mut node.children[index], rest);

                let child = &node.children[index];
                if child.entry.is_none() && child.children.is_empty() {
                    node.children.remove(index);
                }

                removed
            }
        }
    }

    /// Looks up the resource entry at `path`, segment by segment.
    pub fn lookup(&self, path: &str) -> Option<&ResourceEntry> {
        let mut node = &self.root;

        for segment in split_path(path) {
            node = node.child(segment)?;
        }

        node.entry.as_ref()
    }

    /// Visits every registered resource as `(path, entry)`, in tree order.
    pub fn for_each<F: FnMut(&str, &ResourceEntry)>(&self, mut visit: F) {
        let mut path = String::new();
        Self::walk(&self.root, &mut path, &mut visit);
    }

    fn walk<F: FnMut(&str, &ResourceEntry)>(node: &Node, path: &mut String, visit: &mut F) {
        if let Some(entry) = &node.entry {
            let rendered = if path.is_empty() { "/" } else { path.as_str() };
            visit(rendered, entry);
        }

        for child in &node.children {
            let saved_len = path.len();
            path.push('/');
            path.push_str(&child.segment);
            Self::walk(child, path, visit);
            path.truncate(saved_len);
        }
    }

    /// Renders the link-format discovery listing, restricted by `filter`.
    /// The `/.well-known/core` resource itself is not listed.
    pub fn write_link_format(&self, filter: &LinkFilter, out: &mut String) {
        let mut write = LinkFormatWrite::new(out);

        self.for_each(|path, entry| {
            if entry.kind == ResourceKind::WellKnownCore {
                return;
            }
            if !filter.matches(path, entry) {
                return;
            }

            let mut link = write.link(path);

            if let Some(rt) = &entry.attrs.resource_type {
                link = link.attr_quoted(LINK_ATTR_RESOURCE_TYPE, rt);
            }
            if let Some(interface) = &entry.attrs.interface {
                link = link.attr_quoted(LINK_ATTR_INTERFACE_DESCRIPTION, interface);
            }
            if let Some(ct) = entry.attrs.content_format {
                link = link.attr_u16(LINK_ATTR_CONTENT_FORMAT, ct);
            }
            if let Some(title) = &entry.attrs.title {
                link = link.attr_quoted(LINK_ATTR_TITLE, title);
            }
            if entry.attrs.observable {
                link = link.attr_flag(LINK_ATTR_OBSERVABLE);
            }

            // String writes are infallible.
            let _ = link.finish();
        });

        let _ = write.finish();
    }
}

impl Default for ResourceTree {
    fn default() -> Self {
        ResourceTree::new()
    }
}

/// AND-combined discovery filter parsed from Uri-Query options.
#[derive(Debug, Clone, Default)]
pub struct LinkFilter {
    /// `rt=<resource-type>` filter.
    pub resource_type: Option<String>,

    /// `ct=<content-format>` filter.
    pub content_format: Option<u16>,

    /// `href=<prefix>` filter.
    pub href_prefix: Option<String>,
}

impl LinkFilter {
    /// A filter matching everything.
    pub fn all() -> LinkFilter {
        LinkFilter::default()
    }

    /// Parses `rt=`, `ct=`, and `href=` queries; unrecognized queries are
    /// ignored.
    pub fn from_queries<'a, I: IntoIterator<Item = &'a str>>(queries: I) -> LinkFilter {
        let mut filter = LinkFilter::default();

        for query in queries {
            if let Some(value) = query.strip_prefix("rt=") {
                filter.resource_type = Some(value.to_string());
            } else if let Some(value) = query.strip_prefix("ct=") {
                filter.content_format = value.parse().ok();
            } else if let Some(value) = query.strip_prefix("href=") {
                filter.href_prefix = Some(value.to_string());
            }
        }

        filter
    }

    /// Returns true if this filter has no conditions.
    pub fn is_all(&self) -> bool {
        self.resource_type.is_none()
            && self.content_format.is_none()
            && self.href_prefix.is_none()
    }

    /// Returns true if the resource at `path` satisfies every condition.
    pub fn matches(&self, path: &str, entry: &ResourceEntry) -> bool {
        if let Some(rt) = &self.resource_type {
            if entry.attrs.resource_type.as_deref() != Some(rt.as_str()) {
                return false;
            }
        }

        if let Some(ct) = self.content_format {
            if entry.attrs.content_format != Some(ct) {
                return false;
            }
        }

        if let Some(prefix) = &self.href_prefix {
            if !path.starts_with(prefix.as_str()) {
                return false;
            }
        }

        true
    }
}
