//! Union-find arena of type points.
//!
//! Every value-producing block gets a `PointId` whose representative carries the
//! best known type: `None` (unresolved), a primitive (`number`, `string`,
//! `boolean`, `void`), the array family marker `Array`, or a nominal host type.
//! `parent_type`/`child_type` record the weak "element of" relation between an
//! array point and its element point.

use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type PointId = usize;

pub const NUMBER: &str = "number";
pub const STRING: &str = "string";
pub const BOOLEAN: &str = "boolean";
pub const VOID: &str = "void";
pub const ANY: &str = "any";
pub const ARRAY: &str = "Array";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Point {
    pub link: Option<PointId>,
    pub type_name: Option<String>,
    pub parent_type: Option<PointId>,
    pub child_type: Option<PointId>,
    pub is_array_type: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifyError {
    pub left: String,
    pub right: String,
}

impl Display for UnifyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot mix {} with {}", self.left, self.right)
    }
}

impl Error for UnifyError {}

/// `true` for `T[]` shapes and the bare `Array` family marker.
pub fn is_array_type(type_name: &str) -> bool {
    type_name == ARRAY || type_name.ends_with("[]")
}

/// Element type of an array-shaped type name (`number[]` -> `number`).
pub fn element_type(type_name: &str) -> Option<&str> {
    type_name.strip_suffix("[]")
}

/// Ground type unification. `None` is the identity element.
pub fn unify(t1: Option<&str>, t2: Option<&str>) -> Result<Option<String>, UnifyError> {
    match (t1, t2) {
        (None, other) | (other, None) => Ok(other.map(ToString::to_string)),
        (Some(ARRAY), Some(other)) | (Some(other), Some(ARRAY)) if is_array_type(other) => {
            Ok(Some(other.to_string()))
        }
        (Some(a), Some(b)) if a == b => Ok(Some(a.to_string())),
        (Some(a), Some(b)) => Err(UnifyError {
            left: a.to_string(),
            right: b.to_string(),
        }),
    }
}

#[derive(Debug, Clone)]
pub struct Points {
    points: Vec<Point>,
    number: PointId,
    string: PointId,
    boolean: PointId,
    void: PointId,
}

impl Default for Points {
    fn default() -> Self {
        Self::new()
    }
}

impl Points {
    pub fn new() -> Self {
        let mut points = Self {
            points: Vec::new(),
            number: 0,
            string: 0,
            boolean: 0,
            void: 0,
        };
        points.number = points.mk_point(Some(NUMBER), false);
        points.string = points.mk_point(Some(STRING), false);
        points.boolean = points.mk_point(Some(BOOLEAN), false);
        points.void = points.mk_point(Some(VOID), false);
        points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn mk_point(&mut self, type_name: Option<&str>, is_array_type: bool) -> PointId {
        self.points.push(Point {
            type_name: type_name.map(ToString::to_string),
            is_array_type,
            ..Point::default()
        });
        self.points.len() - 1
    }

    /// Shared point for primitives, a fresh one for every other type.
    pub fn ground(&mut self, type_name: &str) -> PointId {
        match type_name {
            NUMBER => self.number,
            STRING => self.string,
            BOOLEAN => self.boolean,
            VOID => self.void,
            other => self.mk_point(Some(other), is_array_type(other)),
        }
    }

    pub fn get(&self, id: PointId) -> &Point {
        &self.points[id]
    }

    /// Type carried by the representative of `id`.
    pub fn type_of(&mut self, id: PointId) -> Option<String> {
        let rep = self.find(id);
        self.points[rep].type_name.clone()
    }

    pub fn find(&mut self, id: PointId) -> PointId {
        let mut root = id;
        while let Some(next) = self.points[root].link {
            root = next;
        }
        let mut current = id;
        while let Some(next) = self.points[current].link {
            if next != root {
                self.points[current].link = Some(root);
            }
            current = next;
        }
        root
    }

    /// Merges the classes of `p1` and `p2`, linking `p1`'s representative to
    /// `p2`'s. On a ground conflict, including one between linked element
    /// or parent points, nothing is mutated.
    pub fn union(&mut self, p1: PointId, p2: PointId) -> Result<(), UnifyError> {
        self.check_union(p1, p2, &mut HashSet::new())?;
        self.merge(p1, p2)
    }

    /// Walks both classes and their generic links without merging anything.
    fn check_union(
        &mut self,
        p1: PointId,
        p2: PointId,
        seen: &mut HashSet<(PointId, PointId)>,
    ) -> Result<(), UnifyError> {
        let a = self.find(p1);
        let b = self.find(p2);
        if a == b || !seen.insert((a, b)) {
            return Ok(());
        }
        unify(
            self.points[a].type_name.as_deref(),
            self.points[b].type_name.as_deref(),
        )?;
        if let (Some(ca), Some(cb)) = (self.points[a].child_type, self.points[b].child_type) {
            self.check_union(ca, cb, seen)?;
        }
        if let (Some(pa), Some(pb)) = (self.points[a].parent_type, self.points[b].parent_type) {
            self.check_union(pa, pb, seen)?;
        }
        Ok(())
    }

    fn merge(&mut self, p1: PointId, p2: PointId) -> Result<(), UnifyError> {
        let a = self.find(p1);
        let b = self.find(p2);
        if a == b {
            return Ok(());
        }
        unify(
            self.points[a].type_name.as_deref(),
            self.points[b].type_name.as_deref(),
        )?;

        match (self.points[a].child_type, self.points[b].child_type) {
            (Some(ca), Some(cb)) => {
                self.points[a].child_type = None;
                self.merge(ca, cb)?;
            }
            (Some(ca), None) => self.points[b].child_type = Some(ca),
            _ => {}
        }
        match (self.points[a].parent_type, self.points[b].parent_type) {
            (Some(pa), Some(pb)) => {
                self.points[a].parent_type = None;
                self.merge(pa, pb)?;
            }
            (Some(pa), None) => self.points[b].parent_type = Some(pa),
            _ => {}
        }

        let a = self.find(a);
        let b = self.find(b);
        if a == b {
            return Ok(());
        }
        let merged = unify(
            self.points[a].type_name.as_deref(),
            self.points[b].type_name.as_deref(),
        )?;
        let is_array = self.points[a].is_array_type || self.points[b].is_array_type;
        self.points[a].link = Some(b);
        self.points[a].type_name = None;
        self.points[b].type_name = merged;
        self.points[b].is_array_type = is_array;
        Ok(())
    }

    /// Records that `child` is the element type of `parent` without forcing
    /// the two classes together.
    pub fn generic_link(&mut self, parent: PointId, child: PointId) -> Result<(), UnifyError> {
        let p = self.find(parent);
        let c = self.find(child);
        if p == c {
            return Ok(());
        }
        match self.points[p].child_type {
            Some(existing) => self.union(existing, c)?,
            None => {
                let open = matches!(self.points[p].type_name.as_deref(), None | Some(ARRAY));
                if open {
                    self.points[p].child_type = Some(c);
                }
            }
        }

        let p = self.find(p);
        let c = self.find(c);
        match self.points[c].parent_type {
            Some(existing) => self.union(existing, p)?,
            None => {
                if self.points[c].type_name.is_none() {
                    self.points[c].parent_type = Some(p);
                }
            }
        }

        let p = self.find(p);
        if self.points[p]
            .type_name
            .as_deref()
            .is_some_and(is_array_type)
        {
            self.points[p].is_array_type = true;
        }
        Ok(())
    }

    /// Resolves `id` to its best known concrete type, following generic links
    /// in both directions. The resolved name is cached on the representative.
    pub fn concrete_type(&mut self, id: PointId) -> PointId {
        let mut visited = HashSet::new();
        self.concrete_inner(id, &mut visited)
    }

    fn concrete_inner(&mut self, id: PointId, visited: &mut HashSet<PointId>) -> PointId {
        let t = self.find(id);
        if !visited.insert(t) {
            return t;
        }
        let open = matches!(self.points[t].type_name.as_deref(), None | Some(ARRAY));
        if !open {
            return t;
        }
        if let Some(parent) = self.points[t].parent_type {
            let parent = self.concrete_inner(parent, visited);
            let element = self.points[parent]
                .type_name
                .as_deref()
                .and_then(element_type)
                .map(ToString::to_string);
            if let Some(element) = element {
                self.points[t].type_name = Some(element);
                return t;
            }
        }
        if let Some(child) = self.points[t].child_type {
            let child = self.concrete_inner(child, visited);
            let element = self.points[child]
                .type_name
                .clone()
                .filter(|ty| ty != ARRAY);
            if let Some(element) = element {
                self.points[t].type_name = Some(format!("{}[]", element));
                self.points[t].is_array_type = true;
                return t;
            }
        }
        t
    }

    /// Concrete type name of `id`, if any.
    pub fn concrete_type_name(&mut self, id: PointId) -> Option<String> {
        let rep = self.concrete_type(id);
        self.points[rep].type_name.clone()
    }

    pub fn is_array_point(&mut self, id: PointId) -> bool {
        let rep = self.find(id);
        self.points[rep].is_array_type
            || self.points[rep]
                .type_name
                .as_deref()
                .is_some_and(is_array_type)
    }

    /// Overwrites the representative's type. Only used by the final defaulting
    /// pass for function parameters.
    pub fn set_type(&mut self, id: PointId, type_name: &str) {
        let rep = self.find(id);
        self.points[rep].type_name = Some(type_name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(points: &mut Points, ids: &[PointId]) -> Vec<PointId> {
        ids.iter().map(|id| points.find(*id)).collect()
    }

    #[test]
    fn union_joins_classes() {
        let mut points = Points::new();
        let p = points.mk_point(None, false);
        let q = points.mk_point(None, false);
        points.union(p, q).unwrap();
        assert_eq!(points.find(p), points.find(q));
    }

    #[test]
    fn union_order_does_not_change_partition() {
        let mut first = Points::new();
        let (p, q, r) = (
            first.mk_point(None, false),
            first.mk_point(Some(NUMBER), false),
            first.mk_point(None, false),
        );
        let mut second = first.clone();

        first.union(p, q).unwrap();
        first.union(q, r).unwrap();
        second.union(q, r).unwrap();
        second.union(p, q).unwrap();

        let a = partition(&mut first, &[p, q, r]);
        let b = partition(&mut second, &[p, q, r]);
        assert!(a.iter().all(|x| *x == a[0]));
        assert!(b.iter().all(|x| *x == b[0]));
        assert_eq!(first.type_of(p).as_deref(), Some(NUMBER));
        assert_eq!(second.type_of(p).as_deref(), Some(NUMBER));
    }

    #[test]
    fn conflicting_ground_types_fail_without_mutation() {
        let mut points = Points::new();
        let n = points.ground(NUMBER);
        let s = points.ground(STRING);
        let before_n = points.get(n).clone();
        let before_s = points.get(s).clone();
        let err = points.union(n, s).unwrap_err();
        assert_eq!(err.to_string(), "cannot mix number with string");
        assert_eq!(points.get(n), &before_n);
        assert_eq!(points.get(s), &before_s);
    }

    #[test]
    fn conflicting_elements_keep_array_links() {
        let mut points = Points::new();
        let a1 = points.mk_point(None, true);
        let e1 = points.mk_point(None, false);
        let a2 = points.mk_point(None, true);
        let e2 = points.mk_point(None, false);
        points.generic_link(a1, e1).unwrap();
        points.generic_link(a2, e2).unwrap();
        let n = points.ground(NUMBER);
        let s = points.ground(STRING);
        points.union(e1, n).unwrap();
        points.union(e2, s).unwrap();

        assert!(points.union(a1, a2).is_err());
        assert_ne!(points.find(a1), points.find(a2));
        assert_eq!(points.concrete_type_name(a1).as_deref(), Some("number[]"));
        assert_eq!(points.concrete_type_name(a2).as_deref(), Some("string[]"));
    }

    #[test]
    fn array_marker_unifies_with_array_shapes() {
        assert_eq!(
            unify(Some(ARRAY), Some("number[]")).unwrap().as_deref(),
            Some("number[]")
        );
        assert_eq!(unify(Some(ARRAY), Some(ARRAY)).unwrap().as_deref(), Some(ARRAY));
        assert!(unify(Some(ARRAY), Some(NUMBER)).is_err());
        assert_eq!(unify(None, None).unwrap(), None);
    }

    #[test]
    fn element_resolution_flows_to_array() {
        let mut points = Points::new();
        let arr = points.mk_point(None, true);
        let elem = points.mk_point(None, false);
        points.generic_link(arr, elem).unwrap();
        let n = points.ground(NUMBER);
        points.union(elem, n).unwrap();
        assert_eq!(points.concrete_type_name(arr).as_deref(), Some("number[]"));
    }

    #[test]
    fn array_resolution_flows_to_element() {
        let mut points = Points::new();
        let arr = points.mk_point(None, true);
        let elem = points.mk_point(None, false);
        points.generic_link(arr, elem).unwrap();
        let strings = points.ground("string[]");
        points.union(arr, strings).unwrap();
        assert_eq!(points.concrete_type_name(elem).as_deref(), Some(STRING));
    }

    #[test]
    fn bidirectional_links_terminate() {
        let mut points = Points::new();
        let a = points.mk_point(None, false);
        let b = points.mk_point(None, false);
        points.generic_link(a, b).unwrap();
        points.generic_link(b, a).unwrap();
        assert_eq!(points.concrete_type_name(a), None);
    }

    #[test]
    fn linked_children_are_unified_on_union() {
        let mut points = Points::new();
        let arr1 = points.mk_point(None, true);
        let elem1 = points.mk_point(None, false);
        let arr2 = points.mk_point(None, true);
        let elem2 = points.mk_point(Some(BOOLEAN), false);
        points.generic_link(arr1, elem1).unwrap();
        points.generic_link(arr2, elem2).unwrap();
        points.union(arr1, arr2).unwrap();
        assert_eq!(points.type_of(elem1).as_deref(), Some(BOOLEAN));
    }
}
