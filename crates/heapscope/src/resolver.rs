//! Address-to-reference-path resolution.
//!
//! Given the address of an object seen in a heap census, [`resolve`] walks the
//! live graph depth-first from a root and reports one chain of property
//! accesses that reaches it, e.g. `window.scene.layers[2]`.
//!
//! The walk keeps its own stack of frames instead of recursing, so the depth
//! cap bounds memory predictably. Every call owns a fresh visited map; nothing
//! is shared between calls, so concurrent resolutions over the same graph do
//! not interfere.

use heapscope_types::ObjectAddress;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::graph::{NodeKind, ObjectGraph, Property, Slot};

pub const DEFAULT_ROOT_LABEL: &str = "window";
pub const DEFAULT_NAMESPACE_PROPERTY: &str = "imports";
pub const DEFAULT_MAX_DEPTH: usize = 256;
pub const DEFAULT_MAX_STEPS: usize = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Label the rendered path starts with.
    pub root_label: String,
    /// Property skipped on the root only. Nested objects carrying a property
    /// with the same name are still traversed.
    pub namespace_property: Option<String>,
    /// Longest path, in segments, the search will report.
    pub max_depth: usize,
    /// Most times a single call may enter an object, root included. An
    /// object entered again through a shorter path counts again.
    pub max_steps: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            root_label: DEFAULT_ROOT_LABEL.to_string(),
            namespace_property: Some(DEFAULT_NAMESPACE_PROPERTY.to_string()),
            max_depth: DEFAULT_MAX_DEPTH,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Field(String),
    Index(String),
}

impl PathSegment {
    pub fn key(&self) -> &str {
        match self {
            Self::Field(key) | Self::Index(key) => key,
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(key) => write!(f, ".{key}"),
            Self::Index(key) => write!(f, "[{key}]"),
        }
    }
}

/// A chain of property accesses starting at a labelled root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReferencePath {
    root: String,
    segments: Vec<PathSegment>,
}

impl ReferencePath {
    pub fn new(root: impl Into<String>, segments: Vec<PathSegment>) -> Self {
        Self {
            root: root.into(),
            segments,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Reads back a rendered path.
    ///
    /// Keys containing `.`, `[` or `]` render ambiguously and are not
    /// accepted here.
    pub fn parse(text: &str) -> Result<Self, PathParseError> {
        if text.is_empty() {
            return Err(PathParseError::Empty);
        }
        let root_end = text.find(['.', '[']).unwrap_or(text.len());
        if root_end == 0 {
            return Err(PathParseError::EmptySegment { offset: 0 });
        }
        let mut segments = Vec::new();
        let mut offset = root_end;
        while offset < text.len() {
            let rest = &text[offset..];
            if let Some(tail) = rest.strip_prefix('.') {
                let len = tail.find(['.', '[', ']']).unwrap_or(tail.len());
                if len == 0 {
                    return Err(PathParseError::EmptySegment { offset });
                }
                segments.push(PathSegment::Field(tail[..len].to_string()));
                offset += 1 + len;
            } else if let Some(tail) = rest.strip_prefix('[') {
                let Some(len) = tail.find(']') else {
                    return Err(PathParseError::Unterminated { offset });
                };
                if len == 0 {
                    return Err(PathParseError::EmptySegment { offset });
                }
                segments.push(PathSegment::Index(tail[..len].to_string()));
                offset += len + 2;
            } else {
                return Err(PathParseError::Unexpected { offset });
            }
        }
        Ok(Self::new(&text[..root_end], segments))
    }

    /// Dereferences the path from `root`. `None` when an access lands on a
    /// missing property or a non-object value, which happens when the graph
    /// changed since the path was produced.
    pub fn follow<G>(&self, graph: &G, root: G::Node) -> Option<G::Node>
    where
        G: ObjectGraph + ?Sized,
    {
        self.segments
            .iter()
            .try_fold(root, |node, segment| match graph.property(node, segment.key())? {
                Slot::Object(child) => Some(child),
                Slot::Null | Slot::Scalar => None,
            })
    }
}

impl fmt::Display for ReferencePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.root)?;
        for segment in &self.segments {
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathParseError {
    Empty,
    EmptySegment { offset: usize },
    Unterminated { offset: usize },
    Unexpected { offset: usize },
}

impl fmt::Display for PathParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "reference path is empty"),
            Self::EmptySegment { offset } => write!(f, "empty path segment at byte {offset}"),
            Self::Unterminated { offset } => write!(f, "unterminated index at byte {offset}"),
            Self::Unexpected { offset } => {
                write!(f, "expected '.' or '[' at byte {offset}")
            }
        }
    }
}

impl std::error::Error for PathParseError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The search found the target or explored everything in reach.
    Completed,
    /// Nothing matched, and at least one branch went past `max_depth`.
    DepthLimited,
    /// The search was abandoned after visiting `max_steps` objects.
    StepBudgetExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOutcome {
    pub path: Option<ReferencePath>,
    /// Objects entered, root included.
    pub visited: usize,
    pub stop: StopReason,
}

impl ResolveOutcome {
    /// The rendered path, or an empty string when nothing matched.
    pub fn path_string(&self) -> String {
        self.path
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }
}

struct Frame<N> {
    properties: std::vec::IntoIter<Property<N>>,
    kind: NodeKind,
    is_root: bool,
}

impl<N: Copy> Frame<N> {
    fn enter<G>(graph: &G, node: N, is_root: bool) -> Self
    where
        G: ObjectGraph<Node = N> + ?Sized,
    {
        Self {
            properties: graph.properties(node).into_iter(),
            kind: graph.kind(node),
            is_root,
        }
    }
}

pub fn resolve<G>(
    graph: &G,
    root: G::Node,
    target: ObjectAddress,
    config: &ResolverConfig,
) -> Option<ReferencePath>
where
    G: ObjectGraph + ?Sized,
{
    resolve_with_stats(graph, root, target, config).path
}

/// Like [`resolve`], also reporting how much of the graph was walked and why
/// the walk stopped.
///
/// The root is entered but never matched against `target`, and any edge that
/// leads back to it is ignored. Objects are recorded with the depth they were
/// reached at before their address is compared, and each is entered at most
/// once. The exception is a walk where `max_depth` has already cut a branch:
/// there an object reached again at a shallower depth is entered again, so a
/// subtree cut off along a long path is still explored along a shorter one.
/// The first match in host iteration order wins.
pub fn resolve_with_stats<G>(
    graph: &G,
    root: G::Node,
    target: ObjectAddress,
    config: &ResolverConfig,
) -> ResolveOutcome
where
    G: ObjectGraph + ?Sized,
{
    let mut visited: HashMap<G::Node, usize> = HashMap::new();
    visited.insert(root, 0);
    let mut entered = 1_usize;

    let mut segments: Vec<PathSegment> = Vec::new();
    let mut stack = vec![Frame::enter(graph, root, true)];
    let mut depth_limited = false;

    while let Some(frame) = stack.last_mut() {
        let Some(property) = frame.properties.next() else {
            stack.pop();
            segments.pop();
            continue;
        };
        let from_root = frame.is_root;
        let parent_kind = frame.kind;

        if from_root && config.namespace_property.as_deref() == Some(property.key.as_str()) {
            continue;
        }
        let Slot::Object(child) = property.value else {
            continue;
        };
        if child == root {
            continue;
        }
        // The child would sit at depth `stack.len()`.
        if stack.len() > config.max_depth {
            depth_limited = true;
            continue;
        }
        let depth = stack.len();
        match visited.get(&child) {
            Some(&seen_at) if !depth_limited || seen_at <= depth => continue,
            _ => {
                visited.insert(child, depth);
            }
        }
        entered += 1;
        if entered > config.max_steps {
            debug!(
                max_steps = config.max_steps,
                %target,
                "reference path search exhausted its step budget"
            );
            return ResolveOutcome {
                path: None,
                visited: visited.len(),
                stop: StopReason::StepBudgetExhausted,
            };
        }

        let segment = match parent_kind {
            NodeKind::Sequence => PathSegment::Index(property.key),
            NodeKind::Record => PathSegment::Field(property.key),
        };
        segments.push(segment);

        if graph.address(child) == target {
            return ResolveOutcome {
                path: Some(ReferencePath::new(config.root_label.clone(), segments)),
                visited: visited.len(),
                stop: StopReason::Completed,
            };
        }
        stack.push(Frame::enter(graph, child, false));
    }

    if depth_limited {
        debug!(
            max_depth = config.max_depth,
            %target,
            visited = visited.len(),
            "reference path search hit the depth cap"
        );
    }
    ResolveOutcome {
        path: None,
        visited: visited.len(),
        stop: if depth_limited {
            StopReason::DepthLimited
        } else {
            StopReason::Completed
        },
    }
}
