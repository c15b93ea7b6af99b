use smallvec::SmallVec;
use tracing::debug;

use crate::primitives::slab::Allocator;
use crate::storage::node::{Array, Condition, NodeType, ParentSlot};
use crate::types::{ColKey, ObjKey, ObjLink, Ref, Result, StrataError, TableKey};

/// Receives the forward links that must be nullified when a target object
/// goes away.
pub trait CascadeState {
    /// Queues the link held by `origin_key` in `origin_table`/`origin_col`
    /// that points at `target`.
    fn enqueue_for_nullification(
        &mut self,
        origin_table: TableKey,
        origin_col: ColKey,
        origin_key: ObjKey,
        target: ObjLink,
    );
}

/// Decoded backlink slot.
///
/// Stored as one 64-bit value: zero when empty, `key << 1 | 1` for a single
/// origin, otherwise the ref of a plain list of origin keys.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BacklinkEntry {
    /// No object links here.
    Empty,
    /// Exactly one origin object.
    Single(ObjKey),
    /// Two or more origins, kept in a child list.
    List(Ref),
}

impl BacklinkEntry {
    /// Decodes a stored slot value.
    pub fn decode(value: i64) -> Self {
        if value == 0 {
            BacklinkEntry::Empty
        } else if value & 1 != 0 {
            BacklinkEntry::Single(ObjKey(value >> 1))
        } else {
            BacklinkEntry::List(Ref::from_value(value))
        }
    }

    /// Encodes the slot value. A single key must fit in 63 bits.
    pub fn encode(self) -> Result<i64> {
        match self {
            BacklinkEntry::Empty => Ok(0),
            BacklinkEntry::Single(key) => key
                .0
                .checked_mul(2)
                .map(|v| v | 1)
                .ok_or(StrataError::Invalid("object key does not fit a backlink slot")),
            BacklinkEntry::List(ref_) => Ok(ref_.to_value()),
        }
    }
}

/// One backlink slot per target object.
#[derive(Debug)]
pub struct ArrayBacklink {
    slots: Array,
}

impl ArrayBacklink {
    /// Allocates a leaf of `size` empty slots.
    pub fn create(alloc: &mut dyn Allocator, size: usize) -> Result<Self> {
        Ok(Self {
            slots: Array::create(alloc, NodeType::HasRefs, false, size, 0)?,
        })
    }

    /// Attaches to the leaf at `ref_`.
    pub fn from_ref(alloc: &dyn Allocator, ref_: Ref) -> Result<Self> {
        let slots = Array::from_ref(alloc, ref_)?;
        if !slots.has_refs() {
            return Err(StrataError::Corruption("backlink leaf must hold refs"));
        }
        Ok(Self { slots })
    }

    /// Sets the slot this leaf's ref is stored in.
    pub fn with_parent(mut self, slot: ParentSlot) -> Self {
        self.slots.set_parent(Some(slot));
        self
    }

    /// Ref of the leaf node.
    pub fn ref_(&self) -> Ref {
        self.slots.ref_()
    }

    /// Number of target objects.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true when the leaf holds no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Decoded slot `ndx`.
    pub fn entry(&self, alloc: &dyn Allocator, ndx: usize) -> Result<BacklinkEntry> {
        Ok(BacklinkEntry::decode(self.slots.get(alloc, ndx)?))
    }

    fn list(&self, alloc: &dyn Allocator, ndx: usize) -> Result<Array> {
        self.slots.child(alloc, ndx)
    }

    /// Records a link from `origin` to object `ndx`.
    pub fn add_backlink(&mut self, alloc: &mut dyn Allocator, ndx: usize, origin: ObjKey) -> Result<()> {
        self.slots.copy_on_write(alloc)?;
        match self.entry(alloc, ndx)? {
            BacklinkEntry::Empty => {
                self.slots.set(alloc, ndx, BacklinkEntry::Single(origin).encode()?)
            }
            BacklinkEntry::Single(first) => {
                let list = Array::create_from(alloc, NodeType::Normal, &[first.0, origin.0])?;
                self.slots.set_as_ref(alloc, ndx, list.ref_())
            }
            BacklinkEntry::List(_) => {
                let mut list = self.list(alloc, ndx)?;
                list.add(alloc, origin.0)
            }
        }
    }

    /// Removes one link from `origin` to object `ndx`.
    ///
    /// A list left with a single origin collapses back to the inline form.
    /// Returns true when the slot became empty.
    pub fn remove_backlink(&mut self, alloc: &mut dyn Allocator, ndx: usize, origin: ObjKey) -> Result<bool> {
        self.slots.copy_on_write(alloc)?;
        match self.entry(alloc, ndx)? {
            BacklinkEntry::Empty => Err(StrataError::Invalid("object has no backlinks")),
            BacklinkEntry::Single(key) => {
                if key != origin {
                    return Err(StrataError::Invalid("backlink origin not found"));
                }
                self.slots.set(alloc, ndx, 0)?;
                Ok(true)
            }
            BacklinkEntry::List(_) => {
                let mut list = self.list(alloc, ndx)?;
                let at = list
                    .find_first(alloc, Condition::Equal, origin.0, 0, list.len())?
                    .ok_or(StrataError::Invalid("backlink origin not found"))?;
                list.erase(alloc, at)?;
                if list.len() == 1 {
                    let last = ObjKey(list.get(alloc, 0)?);
                    list.destroy(alloc)?;
                    self.slots.set(alloc, ndx, BacklinkEntry::Single(last).encode()?)?;
                    debug!(ndx, "backlink.collapsed");
                }
                Ok(false)
            }
        }
    }

    /// Number of links pointing at object `ndx`.
    pub fn get_backlink_count(&self, alloc: &dyn Allocator, ndx: usize) -> Result<usize> {
        Ok(match self.entry(alloc, ndx)? {
            BacklinkEntry::Empty => 0,
            BacklinkEntry::Single(_) => 1,
            BacklinkEntry::List(_) => self.list(alloc, ndx)?.len(),
        })
    }

    /// Origin of link `i` pointing at object `ndx`.
    pub fn get_backlink(&self, alloc: &dyn Allocator, ndx: usize, i: usize) -> Result<ObjKey> {
        match self.entry(alloc, ndx)? {
            BacklinkEntry::Single(key) if i == 0 => Ok(key),
            BacklinkEntry::List(_) => Ok(ObjKey(self.list(alloc, ndx)?.get(alloc, i)?)),
            _ => Err(StrataError::Invalid("backlink index out of range")),
        }
    }

    /// Every origin pointing at object `ndx`.
    pub fn origins(&self, alloc: &dyn Allocator, ndx: usize) -> Result<SmallVec<[ObjKey; 4]>> {
        Ok(match self.entry(alloc, ndx)? {
            BacklinkEntry::Empty => SmallVec::new(),
            BacklinkEntry::Single(key) => smallvec::smallvec![key],
            BacklinkEntry::List(_) => {
                let list = self.list(alloc, ndx)?;
                list.get_all(alloc, 0, list.len())?.into_iter().map(ObjKey).collect()
            }
        })
    }

    /// Replaces the origin `old` with `new` for object `ndx`.
    pub fn update_backlink(
        &mut self,
        alloc: &mut dyn Allocator,
        ndx: usize,
        old: ObjKey,
        new: ObjKey,
    ) -> Result<()> {
        self.slots.copy_on_write(alloc)?;
        match self.entry(alloc, ndx)? {
            BacklinkEntry::Single(key) if key == old => {
                self.slots.set(alloc, ndx, BacklinkEntry::Single(new).encode()?)
            }
            BacklinkEntry::List(_) => {
                let mut list = self.list(alloc, ndx)?;
                let at = list
                    .find_first(alloc, Condition::Equal, old.0, 0, list.len())?
                    .ok_or(StrataError::Invalid("backlink origin not found"))?;
                list.set(alloc, at, new.0)
            }
            _ => Err(StrataError::Invalid("backlink origin not found")),
        }
    }

    /// Exchanges origins `a` and `b` wherever they point at object `ndx`.
    pub fn swap_backlinks(&mut self, alloc: &mut dyn Allocator, ndx: usize, a: ObjKey, b: ObjKey) -> Result<()> {
        self.slots.copy_on_write(alloc)?;
        match self.entry(alloc, ndx)? {
            BacklinkEntry::Empty => Ok(()),
            BacklinkEntry::Single(key) => {
                let swapped = if key == a {
                    b
                } else if key == b {
                    a
                } else {
                    return Ok(());
                };
                self.slots.set(alloc, ndx, BacklinkEntry::Single(swapped).encode()?)
            }
            BacklinkEntry::List(_) => {
                let mut list = self.list(alloc, ndx)?;
                for i in 0..list.len() {
                    let key = list.get(alloc, i)?;
                    if key == a.0 {
                        list.set(alloc, i, b.0)?;
                    } else if key == b.0 {
                        list.set(alloc, i, a.0)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Drops every link to object `ndx`, freeing its list.
    pub fn remove_all(&mut self, alloc: &mut dyn Allocator, ndx: usize) -> Result<()> {
        self.slots.copy_on_write(alloc)?;
        if let BacklinkEntry::List(ref_) = self.entry(alloc, ndx)? {
            Array::destroy_deep_ref(alloc, ref_)?;
        }
        self.slots.set(alloc, ndx, 0)
    }

    /// Queues every forward link into object `ndx` for nullification.
    ///
    /// The backlinks themselves stay until the forward links are cleared.
    pub fn nullify_fwd_links(
        &self,
        alloc: &dyn Allocator,
        ndx: usize,
        target: ObjLink,
        origin_table: TableKey,
        origin_col: ColKey,
        state: &mut dyn CascadeState,
    ) -> Result<()> {
        for origin in self.origins(alloc, ndx)? {
            state.enqueue_for_nullification(origin_table, origin_col, origin, target);
        }
        Ok(())
    }

    /// Inserts an empty slot before `ndx`.
    pub fn insert(&mut self, alloc: &mut dyn Allocator, ndx: usize) -> Result<()> {
        self.slots.insert(alloc, ndx, 0)
    }

    /// Appends an empty slot.
    pub fn add(&mut self, alloc: &mut dyn Allocator) -> Result<()> {
        self.slots.add(alloc, 0)
    }

    /// Removes slot `ndx`, freeing its list.
    pub fn erase(&mut self, alloc: &mut dyn Allocator, ndx: usize) -> Result<()> {
        self.remove_all(alloc, ndx)?;
        self.slots.erase(alloc, ndx)
    }

    /// Frees the leaf and every list.
    pub fn destroy(self, alloc: &mut dyn Allocator) -> Result<()> {
        self.slots.destroy_deep(alloc)
    }
}
