use crate::jpeg2000::bit_io::{J2kBitReader, J2kBitWriter};

/// Value of a leaf whose information has not been decided yet (e.g. a
/// code-block that is not included in any layer so far).
pub const TAG_TREE_UNDECIDED: i32 = i32::MAX;

/// Tag Tree for JPEG 2000 Packet Header coding.
/// Represents a quad-tree structure used to encode 2D arrays of values (e.g. inclusion, zero bit-planes).
///
/// Interior nodes hold the minimum of their children, so leaf values may be
/// lowered incrementally as long as every value already signalled stays valid.
#[derive(Debug, Clone)]
pub struct TagTree {
    nodes: Vec<TagTreeNode>,
    leaf_width: usize,
    leaf_height: usize,
}

#[derive(Clone, Debug)]
struct TagTreeNode {
    value: i32,
    low: i32,
    known: bool,
    parent_index: Option<usize>,
}

impl Default for TagTreeNode {
    fn default() -> Self {
        Self {
            value: TAG_TREE_UNDECIDED,
            low: 0,
            known: false,
            parent_index: None,
        }
    }
}

impl TagTree {
    /// Create a new TagTree for a grid of `w` x `h` leaves.
    pub fn new(w: usize, h: usize) -> Self {
        let mut nodes = Vec::new();

        let mut current_level_start = 0;
        let mut current_w = w;
        let mut current_h = h;

        for _ in 0..(w * h) {
            nodes.push(TagTreeNode::default());
        }

        // Build levels up to root
        while current_w > 1 || current_h > 1 {
            let next_w = current_w.div_ceil(2);
            let next_h = current_h.div_ceil(2);
            let next_level_start = nodes.len();

            for _ in 0..(next_w * next_h) {
                nodes.push(TagTreeNode::default());
            }

            for y in 0..current_h {
                for x in 0..current_w {
                    let child_idx = current_level_start + y * current_w + x;
                    let parent_idx = next_level_start + (y / 2) * next_w + x / 2;
                    nodes[child_idx].parent_index = Some(parent_idx);
                }
            }

            current_w = next_w;
            current_h = next_h;
            current_level_start = next_level_start;
        }

        Self {
            nodes,
            leaf_width: w,
            leaf_height: h,
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_width * self.leaf_height
    }

    /// Reset the tree state (values and known status).
    pub fn reset(&mut self) {
        for node in &mut self.nodes {
            node.value = TAG_TREE_UNDECIDED;
            node.low = 0;
            node.known = false;
        }
    }

    /// Set the value at a leaf coordinate (x, y), lowering ancestors as needed.
    pub fn set_value(&mut self, x: usize, y: usize, value: i32) {
        if x >= self.leaf_width || y >= self.leaf_height {
            return;
        }
        let leaf_idx = y * self.leaf_width + x;
        self.nodes[leaf_idx].value = value;
        let mut idx = self.nodes[leaf_idx].parent_index;
        while let Some(i) = idx {
            if self.nodes[i].value <= value {
                break;
            }
            self.nodes[i].value = value;
            idx = self.nodes[i].parent_index;
        }
    }

    /// Encode the value for leaf at (x, y) given a threshold.
    ///
    /// Emits just enough bits for a decoder to learn whether the leaf value
    /// is below `threshold`, and if so its exact value.
    pub fn encode(&mut self, writer: &mut J2kBitWriter, x: usize, y: usize, threshold: i32) {
        if x >= self.leaf_width || y >= self.leaf_height {
            return;
        }
        let path = self.path_to_root(y * self.leaf_width + x);

        let mut low = 0;
        for &idx in path.iter().rev() {
            let node = &mut self.nodes[idx];
            if low > node.low {
                node.low = low;
            } else {
                low = node.low;
            }
            while low < threshold {
                if low >= node.value {
                    if !node.known {
                        writer.write_bit(1);
                        node.known = true;
                    }
                    break;
                }
                writer.write_bit(0);
                low += 1;
            }
            node.low = low;
        }
    }

    /// Decode the tag tree for leaf (x,y) up to threshold.
    /// Returns true when the leaf value is known to be below the threshold.
    pub fn decode(
        &mut self,
        reader: &mut J2kBitReader,
        x: usize,
        y: usize,
        threshold: i32,
    ) -> Option<bool> {
        if x >= self.leaf_width || y >= self.leaf_height {
            return Some(false);
        }
        let leaf_idx = y * self.leaf_width + x;
        let path = self.path_to_root(leaf_idx);

        let mut low = 0;
        for &idx in path.iter().rev() {
            let node = &mut self.nodes[idx];
            if low > node.low {
                node.low = low;
            } else {
                low = node.low;
            }
            while low < threshold && low < node.value {
                if reader.read_bit()? == 1 {
                    node.value = low;
                } else {
                    low += 1;
                }
            }
            node.low = low;
        }

        Some(self.nodes[leaf_idx].value < threshold)
    }

    /// Decoded (or encoded) value of a leaf, if fully known.
    pub fn value(&self, x: usize, y: usize) -> Option<i32> {
        let node = self.nodes.get(y * self.leaf_width + x)?;
        (node.value != TAG_TREE_UNDECIDED).then_some(node.value)
    }

    fn path_to_root(&self, leaf_idx: usize) -> Vec<usize> {
        let mut path = Vec::new();
        let mut idx = Some(leaf_idx);
        while let Some(i) = idx {
            path.push(i);
            idx = self.nodes[i].parent_index;
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_tree_structure() {
        let tt = TagTree::new(3, 3);
        assert_eq!(tt.nodes.len(), 14);

        let leaf0 = &tt.nodes[0];
        assert_eq!(leaf0.parent_index, Some(9));

        let leaf8 = &tt.nodes[8];
        assert_eq!(leaf8.parent_index, Some(12));
    }

    #[test]
    fn test_set_value_propagates_minimum() {
        let mut tt = TagTree::new(2, 2);
        tt.set_value(1, 1, 4);
        tt.set_value(0, 0, 2);
        tt.set_value(1, 0, 7);
        // Root is the last node.
        assert_eq!(tt.nodes[4].value, 2);
        assert_eq!(tt.nodes[1].value, 7);
    }

    #[test]
    fn test_tag_tree_roundtrip() {
        let values = [[5, 2], [10, 0]];
        let mut enc = TagTree::new(2, 2);
        for (y, row) in values.iter().enumerate() {
            for (x, &v) in row.iter().enumerate() {
                enc.set_value(x, y, v);
            }
        }

        let mut writer = J2kBitWriter::new();
        for y in 0..2 {
            for x in 0..2 {
                enc.encode(&mut writer, x, y, values[y][x] + 1);
            }
        }
        let buffer = writer.finish();

        let mut dec = TagTree::new(2, 2);
        let mut reader = J2kBitReader::new(&buffer);
        for y in 0..2 {
            for x in 0..2 {
                assert_eq!(dec.decode(&mut reader, x, y, values[y][x] + 1), Some(true));
                assert_eq!(dec.value(x, y), Some(values[y][x]));
            }
        }
    }

    #[test]
    fn test_incremental_inclusion_layers() {
        // Leaf (0,0) first included in layer 0, leaf (1,0) only in layer 2.
        let mut enc = TagTree::new(2, 1);
        let mut writer = J2kBitWriter::new();

        enc.set_value(0, 0, 0);
        enc.encode(&mut writer, 0, 0, 1);
        enc.encode(&mut writer, 1, 0, 1);
        enc.encode(&mut writer, 1, 0, 2);
        enc.set_value(1, 0, 2);
        enc.encode(&mut writer, 1, 0, 3);
        let buffer = writer.finish();

        let mut dec = TagTree::new(2, 1);
        let mut reader = J2kBitReader::new(&buffer);
        assert_eq!(dec.decode(&mut reader, 0, 0, 1), Some(true));
        assert_eq!(dec.decode(&mut reader, 1, 0, 1), Some(false));
        assert_eq!(dec.decode(&mut reader, 1, 0, 2), Some(false));
        assert_eq!(dec.decode(&mut reader, 1, 0, 3), Some(true));
        assert_eq!(dec.value(1, 0), Some(2));
    }
}
