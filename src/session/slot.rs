//! Display slot table
//!
//! Slots are laid out once at start-up and never resized:
//!
//! ```text
//! index:  0        1 ..= P        P+1 ..= P+B     P+B+1 ..= P+B+V
//! kind:   primary  pluggable      built-in        virtual
//! ```
//!
//! A slot's index is also the client-visible display id.

use log::{info, warn};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use super::lock::{DisplayLock, SlotGuard, VmRelease};
use crate::constants::MAX_SLOTS;
use crate::engine::DisplayKind;

/// Called with a slot index right before that slot's lock is acquired
pub type LockObserver = Arc<dyn Fn(usize) + Send + Sync>;

/// Numbers of slots per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    pub pluggable: usize,
    pub builtin: usize,
    pub virtuals: usize,
}

impl SlotLayout {
    /// Build a layout from per-kind caps; the primary consumes one slot of
    /// its own hardware class.
    ///
    /// The table never exceeds `MAX_SLOTS`; caps beyond it are cut from
    /// the virtual, then built-in, then pluggable classes.
    pub fn new(
        primary_is_pluggable: bool,
        max_builtin: usize,
        max_pluggable: usize,
        max_virtual: usize,
    ) -> Self {
        let (builtin, pluggable) = if primary_is_pluggable {
            (max_builtin, max_pluggable.saturating_sub(1))
        } else {
            (max_builtin.saturating_sub(1), max_pluggable)
        };
        let budget = MAX_SLOTS - 1;
        let pluggable_kept = pluggable.min(budget);
        let builtin_kept = builtin.min(budget - pluggable_kept);
        let virtuals = max_virtual.min(budget - pluggable_kept - builtin_kept);
        if (pluggable_kept, builtin_kept, virtuals) != (pluggable, builtin, max_virtual) {
            warn!(
                "Slot caps exceed {} displays, clamped to {} pluggable, {} built-in, {} virtual",
                MAX_SLOTS, pluggable_kept, builtin_kept, virtuals
            );
        }
        Self {
            pluggable: pluggable_kept,
            builtin: builtin_kept,
            virtuals,
        }
    }

    pub fn total(&self) -> usize {
        1 + self.pluggable + self.builtin + self.virtuals
    }
}

/// Well-known display aliases used by the vendor channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayType {
    Primary,
    External,
    External2,
    Virtual,
    Virtual2,
    BuiltIn2,
}

impl DisplayType {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(DisplayType::Primary),
            1 => Some(DisplayType::External),
            2 => Some(DisplayType::Virtual),
            3 => Some(DisplayType::BuiltIn2),
            4 => Some(DisplayType::External2),
            5 => Some(DisplayType::Virtual2),
            _ => None,
        }
    }
}

/// One fixed slot
#[derive(Debug)]
pub struct Slot {
    client_id: u64,
    kind: DisplayKind,
    pub(crate) lock: DisplayLock,
    pub(crate) vm: VmRelease,
}

impl Slot {
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn kind(&self) -> DisplayKind {
        self.kind
    }
}

/// Point-in-time view of a slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub client_id: u64,
    pub kind: DisplayKind,
    /// -1 when nothing is bound
    pub hardware_id: i32,
    pub in_use: bool,
}

pub struct SlotTable {
    slots: Vec<Slot>,
    observer: RwLock<Option<LockObserver>>,
}

impl std::fmt::Debug for SlotTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotTable").field("slots", &self.slots).finish()
    }
}

impl SlotTable {
    pub fn new(layout: SlotLayout, settle_timeout: Duration) -> Self {
        let kinds = std::iter::once(DisplayKind::Primary)
            .chain(std::iter::repeat(DisplayKind::Pluggable).take(layout.pluggable))
            .chain(std::iter::repeat(DisplayKind::BuiltIn).take(layout.builtin))
            .chain(std::iter::repeat(DisplayKind::Virtual).take(layout.virtuals));
        let slots: Vec<Slot> = kinds
            .enumerate()
            .map(|(index, kind)| Slot {
                client_id: index as u64,
                kind,
                lock: DisplayLock::new(settle_timeout),
                vm: VmRelease::default(),
            })
            .collect();
        info!(
            "Slot table: {} slots (pluggable={}, builtin={}, virtual={})",
            slots.len(),
            layout.pluggable,
            layout.builtin,
            layout.virtuals
        );
        Self {
            slots,
            observer: RwLock::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Map a client display id to a slot index
    pub fn resolve(&self, display: u64) -> Option<usize> {
        usize::try_from(display)
            .ok()
            .filter(|&index| index < self.slots.len())
    }

    pub fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    pub fn client_id(&self, index: usize) -> u64 {
        self.slots[index].client_id
    }

    pub fn kind(&self, index: usize) -> DisplayKind {
        self.slots[index].kind
    }

    /// Slot indices of `kind`, ascending
    pub fn indices(&self, kind: DisplayKind) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(move |(_, slot)| slot.kind == kind)
            .map(|(index, _)| index)
    }

    /// Slots that can carry a physical display, ascending
    pub fn real_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.kind != DisplayKind::Virtual)
            .map(|(index, _)| index)
    }

    pub fn index_for_type(&self, display_type: DisplayType) -> Option<usize> {
        match display_type {
            DisplayType::Primary => Some(0),
            DisplayType::External => self.indices(DisplayKind::Pluggable).next(),
            DisplayType::External2 => self.indices(DisplayKind::Pluggable).nth(1),
            DisplayType::Virtual => self.indices(DisplayKind::Virtual).next(),
            DisplayType::Virtual2 => self.indices(DisplayKind::Virtual).nth(1),
            DisplayType::BuiltIn2 => self.indices(DisplayKind::BuiltIn).next(),
        }
    }

    /// Install a hook that observes every lock acquisition
    pub fn set_lock_observer(&self, observer: Option<LockObserver>) {
        let mut slot = self
            .observer
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = observer;
    }

    fn observe(&self, index: usize) {
        let observer = self
            .observer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(observer) = observer {
            observer(index);
        }
    }

    pub fn lock(&self, index: usize) -> SlotGuard<'_> {
        self.observe(index);
        self.slots[index].lock.lock()
    }

    pub fn lock_settled(&self, index: usize) -> SlotGuard<'_> {
        self.observe(index);
        self.slots[index].lock.lock_settled()
    }

    /// Acquire every slot lock in ascending index order
    pub fn lock_all(&self) -> Vec<SlotGuard<'_>> {
        (0..self.slots.len()).map(|index| self.lock(index)).collect()
    }

    pub fn notify(&self, index: usize) {
        self.slots[index].lock.notify();
    }

    pub fn snapshot(&self, index: usize) -> SlotSnapshot {
        let state = self.lock(index);
        let slot = &self.slots[index];
        SlotSnapshot {
            client_id: slot.client_id,
            kind: slot.kind,
            hardware_id: state.display.as_ref().map(|d| d.hw_id).unwrap_or(-1),
            in_use: state.display.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn table() -> SlotTable {
        SlotTable::new(SlotLayout::new(false, 2, 2, 2), Duration::from_millis(10))
    }

    #[test]
    fn test_layout_accounts_for_primary() {
        let builtin_primary = SlotLayout::new(false, 2, 2, 1);
        assert_eq!((builtin_primary.builtin, builtin_primary.pluggable), (1, 2));
        let pluggable_primary = SlotLayout::new(true, 2, 2, 1);
        assert_eq!((pluggable_primary.builtin, pluggable_primary.pluggable), (2, 1));
        assert_eq!(pluggable_primary.total(), 5);
    }

    #[test]
    fn test_layout_clamped_to_slot_limit() {
        let layout = SlotLayout::new(false, 100, 40, 100);
        assert_eq!(layout.total(), MAX_SLOTS);
        assert_eq!((layout.pluggable, layout.builtin, layout.virtuals), (40, 23, 0));
        let small = SlotLayout::new(false, 2, 2, 2);
        assert_eq!(small.total(), 6);
    }

    #[test]
    fn test_slot_order() {
        let table = table();
        let kinds: Vec<_> = (0..table.len()).map(|i| table.kind(i)).collect();
        assert_eq!(
            kinds,
            vec![
                DisplayKind::Primary,
                DisplayKind::Pluggable,
                DisplayKind::Pluggable,
                DisplayKind::BuiltIn,
                DisplayKind::Virtual,
                DisplayKind::Virtual,
            ]
        );
        assert_eq!(table.client_id(4), 4);
    }

    #[test]
    fn test_resolve_and_aliases() {
        let table = table();
        assert_eq!(table.resolve(2), Some(2));
        assert_eq!(table.resolve(6), None);
        assert_eq!(table.resolve(u64::MAX), None);
        assert_eq!(table.index_for_type(DisplayType::External2), Some(2));
        assert_eq!(table.index_for_type(DisplayType::BuiltIn2), Some(3));
        assert_eq!(table.index_for_type(DisplayType::Virtual2), Some(5));
    }

    #[test]
    fn test_unbound_snapshot() {
        let table = table();
        let snap = table.snapshot(1);
        assert_eq!(snap.hardware_id, -1);
        assert!(!snap.in_use);
    }

    #[test]
    fn test_lock_all_is_ascending() {
        let table = table();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        table.set_lock_observer(Some(Arc::new(move |index| {
            sink.lock().unwrap().push(index);
        })));
        let guards = table.lock_all();
        assert_eq!(guards.len(), 6);
        drop(guards);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }
}
