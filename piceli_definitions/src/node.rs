use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::fmt;

/// A scalar leaf in a spec tree.
#[derive(Clone, Debug)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Scalar) -> bool {
        use self::Scalar::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            // bit equality so that NaN does not poison whole-tree comparisons
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (String(a), String(b)) => a == b,
            _ => false,
        }
    }
}

/// One addressing step into a spec tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    Key(String),
    Index(usize),
}

/// Render a path in the dotted form used by diagnostics,
/// e.g. `spec.template.spec.containers[0].image`.
pub fn render_path(path: &[Step]) -> String {
    let mut out = String::new();
    for step in path {
        match step {
            Step::Key(k) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(k);
            }
            Step::Index(i) => out.push_str(&format!("[{}]", i)),
        }
    }
    out
}

/// Does `path` exactly match a `pattern` of segments?
///
/// A `"*"` segment matches any single step; other segments match map keys
/// only. Segments may contain dots (annotation keys), which is why patterns
/// are segment slices rather than dotted strings.
pub fn path_matches(path: &[Step], pattern: &[&str]) -> bool {
    path.len() == pattern.len() && path_has_prefix(path, pattern)
}

/// Does `path` start with `pattern`?
pub fn path_has_prefix(path: &[Step], pattern: &[&str]) -> bool {
    if path.len() < pattern.len() {
        return false;
    }
    path.iter().zip(pattern.iter()).all(|(s, p)| match s {
        Step::Key(k) => k == p,
        Step::Index(_) => *p == "*",
    })
}

/// The spec tree: a dynamically typed kubernetes object body.
///
/// Maps preserve the insertion order chosen by the loader so that
/// serialized output and diff listings stay stable across runs. Equality
/// is structural and order-insensitive for maps.
#[derive(Clone, Debug)]
pub enum Node {
    Scalar(Scalar),
    Seq(Vec<Node>),
    Map(Vec<(String, Node)>),
}

impl Node {
    pub fn null() -> Node {
        Node::Scalar(Scalar::Null)
    }

    pub fn seq(items: Vec<Node>) -> Node {
        Node::Seq(items)
    }

    pub fn map(entries: Vec<(String, Node)>) -> Node {
        Node::Map(entries)
    }

    pub fn is_null(&self) -> bool {
        match self {
            Node::Scalar(Scalar::Null) => true,
            _ => false,
        }
    }

    /// Map-key lookup; `None` on non-maps and missing keys.
    pub fn get(&self, key: &str) -> Option<&Node> {
        match self {
            Node::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Node> {
        match self {
            Node::Map(entries) => entries
                .iter_mut()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Insert or replace a map entry, appending new keys at the end.
    /// No-op on non-maps.
    pub fn set(&mut self, key: &str, value: Node) {
        if let Node::Map(entries) = self {
            for (k, v) in entries.iter_mut() {
                if k == key {
                    *v = value;
                    return;
                }
            }
            entries.push((key.to_string(), value));
        }
    }

    /// Remove a map entry, returning it if present.
    pub fn remove(&mut self, key: &str) -> Option<Node> {
        if let Node::Map(entries) = self {
            if let Some(pos) = entries.iter().position(|(k, _)| k == key) {
                return Some(entries.remove(pos).1);
            }
        }
        None
    }

    /// Walk an explicit path into the tree.
    pub fn at(&self, path: &[Step]) -> Option<&Node> {
        let mut cur = self;
        for step in path {
            cur = match (cur, step) {
                (Node::Map(_), Step::Key(k)) => cur.get(k)?,
                (Node::Seq(items), Step::Index(i)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(cur)
    }

    /// Convenience for dotted key paths without sequence indices.
    pub fn dig(&self, keys: &[&str]) -> Option<&Node> {
        let mut cur = self;
        for k in keys {
            cur = cur.get(k)?;
        }
        Some(cur)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::Scalar(Scalar::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Node::Scalar(Scalar::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Node::Scalar(Scalar::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Node]> {
        match self {
            Node::Seq(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(String, Node)]> {
        match self {
            Node::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Compact single-line rendering for diff output.
    pub fn render(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "<unrenderable>".into())
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Node) -> bool {
        match (self, other) {
            (Node::Scalar(a), Node::Scalar(b)) => a == b,
            (Node::Seq(a), Node::Seq(b)) => a == b,
            (Node::Map(a), Node::Map(b)) => {
                a.len() == b.len() && a.iter().all(|(k, v)| other.get(k) == Some(v))
            }
            _ => false,
        }
    }
}

impl From<&str> for Node {
    fn from(s: &str) -> Node {
        Node::Scalar(Scalar::String(s.to_string()))
    }
}

impl From<String> for Node {
    fn from(s: String) -> Node {
        Node::Scalar(Scalar::String(s))
    }
}

impl From<i64> for Node {
    fn from(i: i64) -> Node {
        Node::Scalar(Scalar::Int(i))
    }
}

impl From<bool> for Node {
    fn from(b: bool) -> Node {
        Node::Scalar(Scalar::Bool(b))
    }
}

impl From<f64> for Node {
    fn from(f: f64) -> Node {
        Node::Scalar(Scalar::Float(f))
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Node::Scalar(Scalar::Null) => serializer.serialize_unit(),
            Node::Scalar(Scalar::Bool(b)) => serializer.serialize_bool(*b),
            Node::Scalar(Scalar::Int(i)) => serializer.serialize_i64(*i),
            Node::Scalar(Scalar::Float(f)) => serializer.serialize_f64(*f),
            Node::Scalar(Scalar::String(s)) => serializer.serialize_str(s),
            Node::Seq(items) => serializer.collect_seq(items),
            Node::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

struct NodeVisitor;

impl<'de> Visitor<'de> for NodeVisitor {
    type Value = Node;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any yaml or json value")
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Node, E> {
        Ok(Node::null())
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Node, E> {
        Ok(Node::null())
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> std::result::Result<Node, D::Error> {
        Node::deserialize(d)
    }

    fn visit_bool<E: de::Error>(self, b: bool) -> std::result::Result<Node, E> {
        Ok(Node::Scalar(Scalar::Bool(b)))
    }

    fn visit_i64<E: de::Error>(self, i: i64) -> std::result::Result<Node, E> {
        Ok(Node::Scalar(Scalar::Int(i)))
    }

    fn visit_u64<E: de::Error>(self, u: u64) -> std::result::Result<Node, E> {
        if u <= i64::max_value() as u64 {
            Ok(Node::Scalar(Scalar::Int(u as i64)))
        } else {
            Ok(Node::Scalar(Scalar::Float(u as f64)))
        }
    }

    fn visit_f64<E: de::Error>(self, f: f64) -> std::result::Result<Node, E> {
        Ok(Node::Scalar(Scalar::Float(f)))
    }

    fn visit_str<E: de::Error>(self, s: &str) -> std::result::Result<Node, E> {
        Ok(Node::Scalar(Scalar::String(s.to_string())))
    }

    fn visit_string<E: de::Error>(self, s: String) -> std::result::Result<Node, E> {
        Ok(Node::Scalar(Scalar::String(s)))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Node, A::Error> {
        let mut items = Vec::new();
        while let Some(el) = seq.next_element::<Node>()? {
            items.push(el);
        }
        Ok(Node::Seq(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Node, A::Error> {
        let mut entries = Vec::new();
        while let Some((k, v)) = map.next_entry::<String, Node>()? {
            entries.push((k, v));
        }
        Ok(Node::Map(entries))
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Node, D::Error> {
        d.deserialize_any(NodeVisitor)
    }
}
