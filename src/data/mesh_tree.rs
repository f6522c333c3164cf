//! Hierarchical collection of mesh pieces.
//!
//! Leaves hold at most one piece (`None` marks an empty slot, e.g. a block this
//! rank does not own). Flattening is depth-first, left to right; that order is
//! the dataset numbering used by [`crate::algs::point_set::PointSet`].

use super::mesh_piece::MeshPiece;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub enum MeshTree {
    Leaf(Option<Arc<MeshPiece>>),
    Node(Vec<MeshTree>),
}

impl Default for MeshTree {
    fn default() -> Self {
        MeshTree::Leaf(None)
    }
}

impl From<MeshPiece> for MeshTree {
    fn from(piece: MeshPiece) -> Self {
        MeshTree::Leaf(Some(Arc::new(piece)))
    }
}

impl MeshTree {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A single-level tree with one leaf per piece.
    pub fn from_pieces(pieces: impl IntoIterator<Item = MeshPiece>) -> Self {
        MeshTree::Node(pieces.into_iter().map(MeshTree::from).collect())
    }

    /// Non-empty pieces in depth-first order.
    pub fn pieces(&self) -> Vec<Arc<MeshPiece>> {
        let mut out = Vec::new();
        self.collect_into(&mut out);
        out
    }

    fn collect_into(&self, out: &mut Vec<Arc<MeshPiece>>) {
        match self {
            MeshTree::Leaf(Some(p)) => out.push(Arc::clone(p)),
            MeshTree::Leaf(None) => {}
            MeshTree::Node(children) => children.iter().for_each(|c| c.collect_into(out)),
        }
    }

    pub fn num_pieces(&self) -> usize {
        match self {
            MeshTree::Leaf(p) => usize::from(p.is_some()),
            MeshTree::Node(children) => children.iter().map(MeshTree::num_pieces).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num_pieces() == 0
    }

    /// Same-shaped tree with every piece replaced by `f(index, piece)`, where
    /// `index` is the piece's position in [`MeshTree::pieces`].
    pub fn try_map<E, F>(&self, mut f: F) -> Result<MeshTree, E>
    where
        F: FnMut(usize, &Arc<MeshPiece>) -> Result<MeshPiece, E>,
    {
        let mut next = 0usize;
        self.try_map_inner(&mut f, &mut next)
    }

    fn try_map_inner<E, F>(&self, f: &mut F, next: &mut usize) -> Result<MeshTree, E>
    where
        F: FnMut(usize, &Arc<MeshPiece>) -> Result<MeshPiece, E>,
    {
        Ok(match self {
            MeshTree::Leaf(None) => MeshTree::Leaf(None),
            MeshTree::Leaf(Some(p)) => {
                let i = *next;
                *next += 1;
                MeshTree::Leaf(Some(Arc::new(f(i, p)?)))
            }
            MeshTree::Node(children) => MeshTree::Node(
                children
                    .iter()
                    .map(|c| c.try_map_inner(f, next))
                    .collect::<Result<_, E>>()?,
            ),
        })
    }
}
