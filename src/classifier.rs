//! Identifier Classifier
//!
//! Request paths address a collection either by a caller-chosen name or
//! by the opaque id one instance assigned to it. Only the latter has to
//! be translated before a write can be replayed on the other instance.

/// Length of a hyphenated instance-local id (8-4-4-4-12)
const LOCAL_ID_LEN: usize = 36;

/// Offsets of the group separators
const HYPHEN_OFFSETS: [usize; 4] = [8, 13, 18, 23];

/// Whether a path segment is an instance-local collection id.
///
/// Structural check only: exactly 36 characters, hyphens at offsets 8,
/// 13, 18 and 23, ASCII hex digits everywhere else. Long caller names
/// such as `AUTOTEST_mapping_mapping_1750113115_de1c105b` are rejected no
/// matter their length.
pub fn is_instance_local_id(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    if bytes.len() != LOCAL_ID_LEN {
        return false;
    }

    bytes.iter().enumerate().all(|(i, b)| {
        if HYPHEN_OFFSETS.contains(&i) {
            *b == b'-'
        } else {
            b.is_ascii_hexdigit()
        }
    })
}

/// Sub-resource addressed below a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionOp {
    Add,
    Upsert,
    Update,
    Delete,
    Query,
    Get,
    Count,
    /// The collection itself (get, modify, delete collection)
    Itself,
    /// Any other sub-resource
    Other,
}

impl CollectionOp {
    fn from_segment(segment: Option<&str>) -> CollectionOp {
        match segment {
            None | Some("") => CollectionOp::Itself,
            Some("add") => CollectionOp::Add,
            Some("upsert") => CollectionOp::Upsert,
            Some("update") => CollectionOp::Update,
            Some("delete") => CollectionOp::Delete,
            Some("query") => CollectionOp::Query,
            Some("get") => CollectionOp::Get,
            Some("count") => CollectionOp::Count,
            Some(_) => CollectionOp::Other,
        }
    }

    /// Read-style operations that still travel as POST
    pub fn is_read(self) -> bool {
        matches!(self, CollectionOp::Query | CollectionOp::Get | CollectionOp::Count)
    }
}

/// Where a collection reference sits inside a request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionPath {
    /// The segment after `collections/`, as written
    pub segment: String,
    /// Whether `segment` is an instance-local id
    pub is_local_id: bool,
    /// What the request does to the collection
    pub op: CollectionOp,
}

/// Whether a path addresses the collection list (create / list collections)
pub fn is_collection_list(path: &str) -> bool {
    let path = strip_query(path).trim_end_matches('/');
    path.rsplit('/').next() == Some("collections")
}

/// Locate the collection reference in a request path.
///
/// Handles both `/api/v1/collections/{c}/...` and
/// `/api/v2/tenants/{t}/databases/{d}/collections/{c}/...`. Returns None
/// when the path does not address a single collection.
pub fn parse_collection_path(path: &str) -> Option<CollectionPath> {
    let segments: Vec<&str> = strip_query(path).split('/').collect();
    let pos = segments.iter().position(|s| *s == "collections")?;
    let segment = segments.get(pos + 1).filter(|s| !s.is_empty())?;

    Some(CollectionPath {
        segment: segment.to_string(),
        is_local_id: is_instance_local_id(segment),
        op: CollectionOp::from_segment(segments.get(pos + 2).copied()),
    })
}

/// Replace the collection segment, keeping everything else (query string included)
pub fn replace_collection_segment(path: &str, replacement: &str) -> Option<String> {
    let (route, query) = match path.split_once('?') {
        Some((route, query)) => (route, Some(query)),
        None => (path, None),
    };

    let mut segments: Vec<&str> = route.split('/').collect();
    let pos = segments.iter().position(|s| *s == "collections")?;
    let slot = segments.get_mut(pos + 1).filter(|s| !s.is_empty())?;
    *slot = replacement;

    let mut rewritten = segments.join("/");
    if let Some(query) = query {
        rewritten.push('?');
        rewritten.push_str(query);
    }
    Some(rewritten)
}

fn strip_query(path: &str) -> &str {
    path.split_once('?').map(|(route, _)| route).unwrap_or(path)
}
