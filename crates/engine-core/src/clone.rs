//! Defensive cloning of printed values
//!
//! `print` must not hand live script objects to the UI. Values are copied
//! into [`Cloned`] trees here, independent of the engine that produced them:
//! a script host implements [`Inspect`] for its value type and calls
//! [`clone_values`].

use std::collections::HashMap;
use std::hash::Hash;

use figpad_protocol::{Cloned, ErrorDescriptor};

use crate::stack;

/// Properties that mark host-native objects which are printed without walking
pub const PASS_THROUGH_MARKERS: &[&str] = &["__figpadImg", "__figpadLazySeq"];

/// Default cap for printed binary buffers
pub const DEFAULT_BYTES_CAP: usize = 50;

/// Nesting depth past which containers are elided
const MAX_DEPTH: usize = 64;

/// Engine value viewed by the cloner
pub enum Shape<V> {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<V>),
    /// Enumerable properties in iteration order
    Object(Vec<(String, V)>),
    /// String form of a date
    Date(String),
    Error { display: String, stack: Option<String> },
    /// Leading bytes of a binary buffer; at most the cap passed to `shape`
    Bytes(Vec<u8>),
    Function(String),
    Marked { marker: String, repr: serde_json::Value },
}

/// Read access to engine values
pub trait Inspect: Clone {
    type Identity: Hash + Eq;

    fn shape(&self, bytes_cap: usize) -> Shape<Self>;

    /// Object identity, used for cycle detection. Only consulted for arrays
    /// and objects.
    fn identity(&self) -> Self::Identity;
}

/// Clone a list of values, sharing one seen-set across all of them
pub fn clone_values<V: Inspect>(values: &[V], bytes_cap: usize) -> Vec<Cloned> {
    let mut cloner = Cloner {
        seen: HashMap::new(),
        next_id: 0,
        bytes_cap,
    };
    values.iter().map(|v| cloner.clone_value(v, 0)).collect()
}

struct Cloner<V: Inspect> {
    seen: HashMap<V::Identity, u32>,
    next_id: u32,
    bytes_cap: usize,
}

impl<V: Inspect> Cloner<V> {
    fn clone_value(&mut self, value: &V, depth: usize) -> Cloned {
        match value.shape(self.bytes_cap) {
            Shape::Undefined => Cloned::Undefined,
            Shape::Null => Cloned::Null,
            Shape::Bool(b) => Cloned::Bool(b),
            Shape::Number(n) => Cloned::Number(n),
            Shape::String(s) | Shape::Date(s) => Cloned::String(s),
            Shape::Function(name) => Cloned::Function { name },
            Shape::Marked { marker, repr } => Cloned::Opaque { marker, repr },
            Shape::Bytes(mut bytes) => {
                bytes.truncate(self.bytes_cap);
                Cloned::Bytes(bytes)
            }
            Shape::Error { display, stack } => {
                let frames = stack.as_deref().map(stack::user_frames).unwrap_or_default();
                let srcpos = stack::first_source_pos(&frames, 0);
                Cloned::Error(ErrorDescriptor {
                    message: display,
                    stack: stack::without_main(frames),
                    srcpos,
                })
            }
            Shape::Array(items) => {
                let id = match self.visit(value) {
                    Ok(id) => id,
                    Err(seen) => return Cloned::Ref(seen),
                };
                if depth >= MAX_DEPTH {
                    return Cloned::String("[…]".into());
                }
                let items = items.iter().map(|v| self.clone_value(v, depth + 1)).collect();
                Cloned::Array { id, items }
            }
            Shape::Object(entries) => {
                let id = match self.visit(value) {
                    Ok(id) => id,
                    Err(seen) => return Cloned::Ref(seen),
                };
                if depth >= MAX_DEPTH {
                    return Cloned::String("{…}".into());
                }
                let entries = entries
                    .iter()
                    .map(|(k, v)| (k.clone(), self.clone_value(v, depth + 1)))
                    .collect();
                Cloned::Object { id, entries }
            }
        }
    }

    /// Record a container; `Err` carries the id of an earlier copy
    fn visit(&mut self, value: &V) -> Result<u32, u32> {
        let next = self.next_id;
        let id = *self.seen.entry(value.identity()).or_insert(next);
        if id != next {
            return Err(id);
        }
        self.next_id += 1;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Minimal object graph standing in for engine values
    #[derive(Clone)]
    enum Fake {
        Num(f64),
        Text(&'static str),
        Bin(Vec<u8>),
        Obj(Rc<RefCell<Vec<(String, Fake)>>>),
        List(Rc<RefCell<Vec<Fake>>>),
        Err(&'static str, &'static str),
        Img,
    }

    impl Inspect for Fake {
        type Identity = usize;

        fn shape(&self, bytes_cap: usize) -> Shape<Self> {
            match self {
                Fake::Num(n) => Shape::Number(*n),
                Fake::Text(s) => Shape::String((*s).into()),
                Fake::Bin(b) => Shape::Bytes(b.iter().copied().take(bytes_cap).collect()),
                Fake::Obj(o) => Shape::Object(o.borrow().clone()),
                Fake::List(l) => Shape::Array(l.borrow().clone()),
                Fake::Err(display, stack) => Shape::Error {
                    display: (*display).into(),
                    stack: Some((*stack).into()),
                },
                Fake::Img => Shape::Marked {
                    marker: "__figpadImg".into(),
                    repr: serde_json::json!({"width": 2}),
                },
            }
        }

        fn identity(&self) -> usize {
            match self {
                Fake::Obj(o) => Rc::as_ptr(o) as usize,
                Fake::List(l) => Rc::as_ptr(l) as usize,
                _ => 0,
            }
        }
    }

    fn obj(entries: Vec<(&str, Fake)>) -> Fake {
        Fake::Obj(Rc::new(RefCell::new(
            entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        )))
    }

    #[test]
    fn self_cycle_points_at_clone() {
        let a = obj(vec![("n", Fake::Num(1.0))]);
        if let Fake::Obj(inner) = &a {
            inner.borrow_mut().push(("self".into(), a.clone()));
        }
        let cloned = clone_values(&[a], DEFAULT_BYTES_CAP);
        assert_eq!(
            cloned[0],
            Cloned::Object {
                id: 0,
                entries: vec![
                    ("n".into(), Cloned::Number(1.0)),
                    ("self".into(), Cloned::Ref(0)),
                ],
            }
        );
    }

    #[test]
    fn seen_set_is_shared_across_arguments() {
        let shared = Fake::List(Rc::new(RefCell::new(vec![Fake::Text("x")])));
        let cloned = clone_values(&[shared.clone(), shared], DEFAULT_BYTES_CAP);
        assert!(matches!(cloned[0], Cloned::Array { id: 0, .. }));
        assert_eq!(cloned[1], Cloned::Ref(0));
    }

    #[test]
    fn wide_graphs_keep_ids_distinct() {
        let children: Vec<Fake> = (0..5000).map(|i| obj(vec![("i", Fake::Num(i as f64))])).collect();
        let mut items = children.clone();
        items.extend(children.iter().rev().cloned());
        let root = Fake::List(Rc::new(RefCell::new(items)));

        let cloned = clone_values(&[root], DEFAULT_BYTES_CAP);
        let Cloned::Array { items, .. } = &cloned[0] else {
            panic!("unexpected {:?}", cloned[0]);
        };
        assert_eq!(items.len(), 10_000);
        assert!(matches!(items[4999], Cloned::Object { id: 5000, .. }));
        assert_eq!(items[5000], Cloned::Ref(5000));
        assert_eq!(items[9999], Cloned::Ref(1));
    }

    #[test]
    fn buffers_are_truncated() {
        let cloned = clone_values(&[Fake::Bin(vec![7; 200])], DEFAULT_BYTES_CAP);
        match &cloned[0] {
            Cloned::Bytes(b) => assert_eq!(b.len(), 50),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn errors_drop_the_main_frame() {
        let err = Fake::Err(
            "Error: boom",
            "    at f (<input>:14:2)\n    at __script_main (<input>:20:1)",
        );
        let cloned = clone_values(&[err], DEFAULT_BYTES_CAP);
        match &cloned[0] {
            Cloned::Error(desc) => {
                assert_eq!(desc.message, "Error: boom");
                assert_eq!(desc.stack.len(), 1);
                assert_eq!(desc.stack[0].function.as_deref(), Some("f"));
                assert_eq!(desc.srcpos.map(|p| p.line), Some(14));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn marked_objects_pass_through() {
        let cloned = clone_values(&[obj(vec![("img", Fake::Img)])], DEFAULT_BYTES_CAP);
        match &cloned[0] {
            Cloned::Object { entries, .. } => {
                assert!(matches!(&entries[0].1, Cloned::Opaque { marker, .. } if marker == "__figpadImg"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
