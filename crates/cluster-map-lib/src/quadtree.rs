//! Quadtree spatial index over rectangles in normalized Web Mercator space
//!
//! Every zoom level of the cluster index keeps one of these trees. Entries are
//! stored at the deepest node that fully contains them, so large entries (clusters
//! whose members spread over a wide area) stay close to the root while single
//! points sink down to small leaves. Queries cull whole subtrees whose bounds do
//! not intersect the requested rectangle.

use crate::utils;
use geo::{Coord, Rect};

/// Maximum depth of the quadtree to prevent infinite recursion on duplicates
const MAX_DEPTH: u32 = 24;

/// A rectangle tagged with the caller's identifier
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Entry {
    pub id: u32,
    pub rect: Rect<f64>,
}

impl Entry {
    pub fn point(id: u32, coord: Coord<f64>) -> Self {
        Self {
            id,
            rect: Rect::new(coord, coord),
        }
    }
}

/// Root container for the quadtree spatial index
#[derive(Debug, Clone)]
pub(crate) struct Quadtree {
    /// Root node covering the normalized unit square
    root: QuadtreeNode,
    /// Leaf capacity before a node subdivides
    max_items_per_node: usize,
    len: usize,
}

/// A single node in the quadtree
#[derive(Debug, Clone)]
struct QuadtreeNode {
    /// Bounds in normalized coordinates
    bounding_box: Rect<f64>,
    /// Depth level in the tree (0 = root)
    level: u32,
    /// Entries that do not fit entirely inside a single child
    entries: Vec<Entry>,
    /// Child nodes (NW, NE, SW, SE) if subdivided
    children: Option<Box<[QuadtreeNode; 4]>>,
}

impl Quadtree {
    /// Create a new empty quadtree covering the whole world
    pub fn new(max_items_per_node: usize) -> Self {
        Self {
            root: QuadtreeNode::new(
                Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 }),
                0,
            ),
            max_items_per_node: max_items_per_node.max(1),
            len: 0,
        }
    }

    /// Build a tree from a batch of entries
    pub fn from_entries(entries: impl IntoIterator<Item = Entry>, max_items_per_node: usize) -> Self {
        let mut tree = Self::new(max_items_per_node);
        for entry in entries {
            tree.insert(entry);
        }
        tree
    }

    pub fn insert(&mut self, entry: Entry) {
        self.root.insert(entry, self.max_items_per_node);
        self.len += 1;
    }

    #[allow(dead_code)] // Used by tests and debug assertions
    pub fn len(&self) -> usize {
        self.len
    }

    /// Collect the ids of every entry whose rectangle intersects `rect`
    ///
    /// The output is not sorted; callers that need a stable order sort it.
    pub fn query(&self, rect: Rect<f64>, results: &mut Vec<u32>) {
        self.root.query(rect, results);
    }

    /// Collect ids of entries intersecting the square of half-size `radius` around `center`
    pub fn query_around(&self, center: Coord<f64>, radius: f64, results: &mut Vec<u32>) {
        let rect = Rect::new(
            Coord {
                x: center.x - radius,
                y: center.y - radius,
            },
            Coord {
                x: center.x + radius,
                y: center.y + radius,
            },
        );
        self.query(rect, results);
    }
}

impl QuadtreeNode {
    fn new(bounding_box: Rect<f64>, level: u32) -> Self {
        Self {
            bounding_box,
            level,
            entries: Vec::new(),
            children: None,
        }
    }

    /// Subdivide this node into 4 children
    fn subdivide(&mut self) {
        if self.children.is_some() {
            return;
        }

        let min = self.bounding_box.min();
        let max = self.bounding_box.max();
        let mid_x = (min.x + max.x) / 2.0;
        let mid_y = (min.y + max.y) / 2.0;
        let child_level = self.level + 1;

        // y grows southwards in normalized space
        let nw = QuadtreeNode::new(
            Rect::new(Coord { x: min.x, y: min.y }, Coord { x: mid_x, y: mid_y }),
            child_level,
        );
        let ne = QuadtreeNode::new(
            Rect::new(Coord { x: mid_x, y: min.y }, Coord { x: max.x, y: mid_y }),
            child_level,
        );
        let sw = QuadtreeNode::new(
            Rect::new(Coord { x: min.x, y: mid_y }, Coord { x: mid_x, y: max.y }),
            child_level,
        );
        let se = QuadtreeNode::new(
            Rect::new(Coord { x: mid_x, y: mid_y }, Coord { x: max.x, y: max.y }),
            child_level,
        );

        self.children = Some(Box::new([nw, ne, sw, se]));
    }

    /// Index of the child that fully contains `rect`, if any
    fn child_for(&self, rect: &Rect<f64>) -> Option<usize> {
        let children = self.children.as_ref()?;
        children
            .iter()
            .position(|child| utils::rect_covers(&child.bounding_box, rect))
    }

    fn insert(&mut self, entry: Entry, max_items: usize) {
        if let Some(index) = self.child_for(&entry.rect) {
            if let Some(children) = &mut self.children {
                children[index].insert(entry, max_items);
                return;
            }
        }

        self.entries.push(entry);

        if self.children.is_none() && self.entries.len() > max_items && self.level < MAX_DEPTH {
            self.subdivide();
            // Push down everything that now fits inside a single child
            let entries = std::mem::take(&mut self.entries);
            for entry in entries {
                match self.child_for(&entry.rect) {
                    Some(index) => {
                        if let Some(children) = &mut self.children {
                            children[index].insert(entry, max_items);
                        }
                    }
                    None => self.entries.push(entry),
                }
            }
        }
    }

    fn query(&self, rect: Rect<f64>, results: &mut Vec<u32>) {
        // Frustum culling - check if this node intersects the query
        if !utils::rects_intersect(&self.bounding_box, &rect) {
            return;
        }

        for entry in &self.entries {
            if utils::rects_intersect(&entry.rect, &rect) {
                results.push(entry.id);
            }
        }

        if let Some(children) = &self.children {
            for child in children.iter() {
                child.query(rect, results);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Rect<f64> {
        Rect::new(Coord { x: x0, y: y0 }, Coord { x: x1, y: y1 })
    }

    fn sorted(mut ids: Vec<u32>) -> Vec<u32> {
        ids.sort_unstable();
        ids
    }

    #[test]
    fn test_quadtree_creation() {
        let tree = Quadtree::new(4);
        assert_eq!(tree.len(), 0);
        assert_eq!(tree.root.level, 0);
        assert!(tree.root.children.is_none());
        assert_eq!(tree.root.bounding_box.width(), 1.0);
    }

    #[test]
    fn test_node_subdivide() {
        let mut node = QuadtreeNode::new(rect(0.0, 0.0, 1.0, 1.0), 0);
        node.subdivide();
        let children = node.children.as_ref().unwrap();
        assert_eq!(children.len(), 4);
        for child in children.iter() {
            assert_eq!(child.level, 1);
            assert_eq!(child.bounding_box.width(), 0.5);
            assert_eq!(child.bounding_box.height(), 0.5);
        }
        // NW is the top-left quadrant
        assert_eq!(children[0].bounding_box.min(), Coord { x: 0.0, y: 0.0 });
        assert_eq!(children[3].bounding_box.max(), Coord { x: 1.0, y: 1.0 });
    }

    #[test]
    fn test_subdivides_when_over_capacity() {
        let entries = (0..10).map(|i| Entry::point(i, Coord { x: 0.1 + i as f64 * 0.01, y: 0.1 }));
        let tree = Quadtree::from_entries(entries, 4);
        assert_eq!(tree.len(), 10);
        assert!(tree.root.children.is_some());
        assert!(tree.root.entries.is_empty());
    }

    #[test]
    fn test_large_entries_stay_high() {
        let mut tree = Quadtree::new(1);
        tree.insert(Entry::point(0, Coord { x: 0.1, y: 0.1 }));
        tree.insert(Entry::point(1, Coord { x: 0.9, y: 0.9 }));
        // Straddles the vertical midline, so it cannot sink into any child
        tree.insert(Entry {
            id: 2,
            rect: rect(0.4, 0.1, 0.6, 0.2),
        });
        assert!(tree.root.children.is_some());
        assert!(tree.root.entries.iter().any(|e| e.id == 2));
    }

    #[test]
    fn test_query_points() {
        let entries = (0..100).map(|i| {
            let x = (i % 10) as f64 / 10.0 + 0.05;
            let y = (i / 10) as f64 / 10.0 + 0.05;
            Entry::point(i, Coord { x, y })
        });
        let tree = Quadtree::from_entries(entries, 4);

        let mut results = Vec::new();
        tree.query(rect(0.0, 0.0, 0.2, 0.2), &mut results);
        assert_eq!(sorted(results), vec![0, 1, 10, 11]);

        let mut results = Vec::new();
        tree.query(rect(0.0, 0.0, 1.0, 1.0), &mut results);
        assert_eq!(results.len(), 100);
    }

    #[test]
    fn test_query_rectangles() {
        let mut tree = Quadtree::new(2);
        tree.insert(Entry {
            id: 1,
            rect: rect(0.1, 0.1, 0.3, 0.3),
        });
        tree.insert(Entry {
            id: 2,
            rect: rect(0.6, 0.6, 0.7, 0.7),
        });
        tree.insert(Entry {
            id: 3,
            rect: rect(0.25, 0.25, 0.65, 0.65),
        });

        let mut results = Vec::new();
        tree.query(rect(0.28, 0.28, 0.29, 0.29), &mut results);
        assert_eq!(sorted(results), vec![1, 3]);

        let mut results = Vec::new();
        tree.query(rect(0.8, 0.8, 0.9, 0.9), &mut results);
        assert!(results.is_empty());
    }

    #[test]
    fn test_query_around() {
        let tree = Quadtree::from_entries(
            [
                Entry::point(0, Coord { x: 0.5, y: 0.5 }),
                Entry::point(1, Coord { x: 0.51, y: 0.5 }),
                Entry::point(2, Coord { x: 0.6, y: 0.5 }),
            ],
            1,
        );
        let mut results = Vec::new();
        tree.query_around(Coord { x: 0.5, y: 0.5 }, 0.02, &mut results);
        assert_eq!(sorted(results), vec![0, 1]);
    }

    #[test]
    fn test_duplicates_terminate() {
        let entries = (0..50).map(|i| Entry::point(i, Coord { x: 0.3, y: 0.3 }));
        let tree = Quadtree::from_entries(entries, 2);
        let mut results = Vec::new();
        tree.query_around(Coord { x: 0.3, y: 0.3 }, 1e-9, &mut results);
        assert_eq!(results.len(), 50);
    }
}
