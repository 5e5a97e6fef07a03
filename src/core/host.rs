//! Host integration seams.
//!
//! The host application owns nodes, their widget lists and the drawing
//! surfaces. The tracker only talks to it through [`PreviewHost`], which is
//! passed by `&mut` into the calls that need it (the tracker never stores a
//! host reference). Widget splicing goes through [`AffordanceList`] and the
//! [`PreviewAffordances`] adapter, never through the host's collection directly.

use std::collections::HashMap;
use std::hash::Hash;

use super::decode::PreviewImage;
use super::session_key::SessionKey;

/// Callbacks the tracker needs from the host.
pub trait PreviewHost {
    /// Drawing surface handle for one visual node
    type Target;

    /// Look up the target for `key`. None if the node is gone or was
    /// reparented; the tracker then drops the session.
    ///
    /// Called once per redraw tick and once per liveness poll.
    fn resolve_target(&mut self, key: &SessionKey) -> Option<Self::Target>;

    /// Show `image` on `target`
    fn draw_frame(&mut self, target: &Self::Target, image: &PreviewImage);

    /// Remove the preview affordance from `target` (explicit session end)
    fn remove_render_target(&mut self, target: Self::Target);
}

/// Ordered, host-owned widget collection of a node.
pub trait AffordanceList {
    type Descriptor: PartialEq + Clone;

    fn affordance_count(&self) -> usize;
    fn insert_affordance(&mut self, index: usize, descriptor: Self::Descriptor);
    /// Remove the first matching entry. Returns false if it was not present.
    fn remove_affordance(&mut self, descriptor: &Self::Descriptor) -> bool;
}

/// Where a preview affordance goes in the node's list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AffordancePosition {
    Front,
    #[default]
    Back,
    /// Clamped to the list length
    At(usize),
}

/// Keeps at most one preview affordance per target.
///
/// `T` identifies the target (node id), `D` is the host's descriptor type.
#[derive(Debug)]
pub struct PreviewAffordances<T, D> {
    inserted: HashMap<T, D>,
    position: AffordancePosition,
}

impl<T: Eq + Hash + Clone, D: PartialEq + Clone> Default for PreviewAffordances<T, D> {
    fn default() -> Self {
        Self::new(AffordancePosition::default())
    }
}

impl<T: Eq + Hash + Clone, D: PartialEq + Clone> PreviewAffordances<T, D> {
    pub fn new(position: AffordancePosition) -> Self {
        Self {
            inserted: HashMap::new(),
            position,
        }
    }

    /// Insert `descriptor` into `list` unless `target` already has one.
    /// Returns true if an insertion happened.
    pub fn ensure<L>(&mut self, list: &mut L, target: &T, descriptor: D) -> bool
    where
        L: AffordanceList<Descriptor = D>,
    {
        if self.inserted.contains_key(target) {
            return false;
        }
        let len = list.affordance_count();
        let index = match self.position {
            AffordancePosition::Front => 0,
            AffordancePosition::Back => len,
            AffordancePosition::At(i) => i.min(len),
        };
        list.insert_affordance(index, descriptor.clone());
        self.inserted.insert(target.clone(), descriptor);
        true
    }

    /// Splice the preview affordance of `target` back out of `list`
    pub fn remove<L>(&mut self, list: &mut L, target: &T) -> bool
    where
        L: AffordanceList<Descriptor = D>,
    {
        match self.inserted.remove(target) {
            Some(descriptor) => list.remove_affordance(&descriptor),
            None => false,
        }
    }

    pub fn has(&self, target: &T) -> bool {
        self.inserted.contains_key(target)
    }

    pub fn len(&self) -> usize {
        self.inserted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
    }
}

/// Plain vectors work as affordance lists (used by the headless host)
impl<D: PartialEq + Clone> AffordanceList for Vec<D> {
    type Descriptor = D;

    fn affordance_count(&self) -> usize {
        self.len()
    }

    fn insert_affordance(&mut self, index: usize, descriptor: D) {
        self.insert(index.min(self.len()), descriptor);
    }

    fn remove_affordance(&mut self, descriptor: &D) -> bool {
        match self.iter().position(|d| d == descriptor) {
            Some(pos) => {
                self.remove(pos);
                true
            }
            None => false,
        }
    }
}
