//! Reach paths.
//!
//! A [`BlockPath`] records how a patch-bearing block was reached: the declared
//! method the walk started from, then zero or more anonymous sub-functions,
//! then the block itself. The text form is what the cache stores and what the
//! rule documents describe.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A method declared in the companion metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodInfo {
    pub rva: u64,
    #[serde(default)]
    pub assembly: String,
    #[serde(default)]
    pub type_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<String>,
}

impl fmt::Display for MethodInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}:{}()", self.assembly, self.type_name, self.name)
    }
}

/// All methods declared at one address. Identical-code folding can put
/// several methods on the same RVA.
pub type MethodList = Arc<[MethodInfo]>;

/// Kind of a path segment, as named in rule documents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PathKind {
    Method,
    EntryBlock,
    SubBlock,
    SubFunction,
}

impl PathKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PathKind::Method => "Method",
            PathKind::EntryBlock => "EntryBlock",
            PathKind::SubBlock => "SubBlock",
            PathKind::SubFunction => "SubFunction",
        }
    }
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a reach path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSegment {
    /// The declared method a walk started from.
    Method(MethodList),
    /// A patch-bearing block that starts at the walk's entry address.
    EntryBlock { index: usize },
    /// Any other patch-bearing block of the walk. `methods` is set when the
    /// block start is itself a declared method.
    SubBlock {
        index: usize,
        methods: Option<MethodList>,
    },
    /// The `index`-th undeclared call target of the walk.
    SubFunction { index: usize },
}

impl PathSegment {
    pub fn kind(&self) -> PathKind {
        match self {
            PathSegment::Method(_) => PathKind::Method,
            PathSegment::EntryBlock { .. } => PathKind::EntryBlock,
            PathSegment::SubBlock { .. } => PathKind::SubBlock,
            PathSegment::SubFunction { .. } => PathKind::SubFunction,
        }
    }

    /// Positional index within the walk; methods have none.
    pub fn index(&self) -> Option<usize> {
        match self {
            PathSegment::Method(_) => None,
            PathSegment::EntryBlock { index }
            | PathSegment::SubBlock { index, .. }
            | PathSegment::SubFunction { index } => Some(*index),
        }
    }

    /// Owning methods, empty when the segment has none.
    pub fn methods(&self) -> &[MethodInfo] {
        match self {
            PathSegment::Method(methods)
            | PathSegment::SubBlock {
                methods: Some(methods),
                ..
            } => &methods[..],
            _ => &[],
        }
    }
}

struct MethodsDisplay<'a>(&'a [MethodInfo]);

impl fmt::Display for MethodsDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, method) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",,")?;
            }
            write!(f, "{}", method)?;
        }
        f.write_str("}")
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Method(methods) => write!(f, "{}", MethodsDisplay(methods)),
            PathSegment::EntryBlock { .. } => f.write_str("^entry"),
            PathSegment::SubBlock {
                index,
                methods: None,
            } => write!(f, "^block_{}", index),
            PathSegment::SubBlock {
                index,
                methods: Some(methods),
            } => write!(f, "^block_{}#{}", index, MethodsDisplay(methods)),
            PathSegment::SubFunction { index } => write!(f, ";sub{}", index),
        }
    }
}

/// Ordered chain of segments from a declared method to a block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockPath(Vec<PathSegment>);

impl BlockPath {
    /// The single-segment path of a declared method.
    pub fn root(methods: MethodList) -> Self {
        Self(vec![PathSegment::Method(methods)])
    }

    /// A copy of this path with `segment` appended.
    pub fn with(&self, segment: PathSegment) -> Self {
        let mut segments = Vec::with_capacity(self.0.len() + 1);
        segments.extend_from_slice(&self.0);
        segments.push(segment);
        Self(segments)
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<PathSegment>> for BlockPath {
    fn from(segments: Vec<PathSegment>) -> Self {
        Self(segments)
    }
}

impl fmt::Display for BlockPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.0 {
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}
