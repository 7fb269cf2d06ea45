//! Mark-and-sweep heap
//!
//! The heap owns every allocated object. Values reference objects by
//! slot index, so no raw pointers cross the collector. Collection is
//! a plain two-phase mark and sweep driven by the VM: mark everything
//! reachable from the roots it is handed, then free the rest.
//!
//! Dead containers do not always give their buffers back to the
//! allocator. Small arrays, maps, and heap strings are emptied and
//! parked in per-type recycle pools so the next allocation of that
//! shape starts with warmed capacity.

use tracing::trace;

use crate::object::{ObjData, ValueMap};
use crate::string::BrioString;
use crate::value::{Value, ValueKind};

/// Run a sweep once this many allocations have happened since the
/// last one.
pub const SWEEP_THRESHOLD: usize = 128;

/// Per-type recycle pool capacity.
const POOL_MAX: usize = 64;

/// Size ceilings for recycling: bigger carcasses are dropped outright.
const ARRAY_RECYCLE_MAX: usize = 1024;
const MAP_RECYCLE_MAX: usize = 1024;
const STRING_RECYCLE_MAX: usize = 4096;

/// Index of an object slot in the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    pub fn new(index: u32) -> Handle {
        Handle(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Default)]
struct Slot {
    marked: bool,
    data: ObjData,
}

#[derive(Debug, Default)]
struct RecyclePools {
    arrays: Vec<Vec<Value>>,
    maps: Vec<ValueMap>,
    strings: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    pinned: Vec<Value>,
    pools: RecyclePools,
    allocs_since_sweep: usize,
}

const VACANT: ObjData = ObjData::Free;

impl Heap {
    pub fn new() -> Heap {
        Heap::default()
    }

    /// Allocate one object record and return the value referencing it.
    pub fn alloc(&mut self, data: ObjData) -> Value {
        self.allocs_since_sweep += 1;
        let index = match self.free.pop() {
            Some(ix) => {
                self.slots[ix as usize].data = data;
                self.slots[ix as usize].marked = false;
                ix
            }
            None => {
                self.slots.push(Slot {
                    marked: false,
                    data,
                });
                (self.slots.len() - 1) as u32
            }
        };
        Value::object(Handle(index))
    }

    pub fn alloc_string(&mut self, s: &str) -> Value {
        let string = if s.len() > 23 {
            match self.pools.strings.pop() {
                Some(mut buf) => {
                    buf.push_str(s);
                    BrioString::from_owned(buf)
                }
                None => BrioString::new(s),
            }
        } else {
            BrioString::new(s)
        };
        self.alloc(ObjData::Str(string))
    }

    /// A cleared array buffer, recycled when one is available.
    pub fn take_array_buffer(&mut self) -> Vec<Value> {
        self.pools.arrays.pop().unwrap_or_default()
    }

    /// A cleared map, recycled when one is available.
    pub fn take_map_buffer(&mut self) -> ValueMap {
        self.pools.maps.pop().unwrap_or_default()
    }

    pub fn get(&self, h: Handle) -> &ObjData {
        match self.slots.get(h.0 as usize) {
            Some(slot) => &slot.data,
            None => &VACANT,
        }
    }

    pub fn get_mut(&mut self, h: Handle) -> &mut ObjData {
        &mut self
            .slots
            .get_mut(h.0 as usize)
            .expect("heap handle out of range")
            .data
    }

    /// Kind of a value, resolving object handles through the heap.
    pub fn kind_of(&self, v: Value) -> ValueKind {
        if v.is_null() {
            ValueKind::Null
        } else if v.is_bool() {
            ValueKind::Bool
        } else if v.is_number() {
            ValueKind::Number
        } else {
            match v.as_handle() {
                Some(h) => self.get(h).kind(),
                None => ValueKind::Null,
            }
        }
    }

    pub fn str_value(&self, v: Value) -> Option<&BrioString> {
        match self.get(v.as_handle()?) {
            ObjData::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn array(&self, v: Value) -> Option<&Vec<Value>> {
        match self.get(v.as_handle()?) {
            ObjData::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn array_mut(&mut self, v: Value) -> Option<&mut Vec<Value>> {
        match self.get_mut(v.as_handle()?) {
            ObjData::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn map(&self, v: Value) -> Option<&ValueMap> {
        match self.get(v.as_handle()?) {
            ObjData::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn map_mut(&mut self, v: Value) -> Option<&mut ValueMap> {
        match self.get_mut(v.as_handle()?) {
            ObjData::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Keep a value alive independently of the VM stacks. Used by
    /// hosts and native functions that hold values across operations.
    pub fn pin(&mut self, v: Value) {
        if v.is_object() {
            self.pinned.push(v);
        }
    }

    /// Drop one pin of a value. Pins nest: pinning twice requires
    /// unpinning twice.
    pub fn unpin(&mut self, v: Value) {
        if let Some(ix) = self.pinned.iter().position(|p| *p == v) {
            self.pinned.swap_remove(ix);
        }
    }

    pub fn should_collect(&self) -> bool {
        self.allocs_since_sweep > SWEEP_THRESHOLD
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_marked(&self, h: Handle) -> bool {
        self.slots.get(h.0 as usize).is_some_and(|s| s.marked)
    }

    /// Mark everything reachable from `roots` (plus the pin list) and
    /// sweep the rest. Survivors keep their mark bit until the next
    /// collection unmarks them.
    pub fn collect(&mut self, roots: &[Value]) {
        for slot in &mut self.slots {
            slot.marked = false;
        }

        let mut worklist: Vec<Handle> = Vec::new();
        for v in roots.iter().chain(self.pinned.iter()) {
            if let Some(h) = v.as_handle() {
                if let Some(slot) = self.slots.get_mut(h.0 as usize) {
                    if !slot.marked {
                        slot.marked = true;
                        worklist.push(h);
                    }
                }
            }
        }
        let mut children: Vec<Value> = Vec::new();
        while let Some(h) = worklist.pop() {
            children.clear();
            match &self.slots[h.0 as usize].data {
                ObjData::Array(items) => children.extend_from_slice(items),
                ObjData::Map(map) => {
                    for (k, v) in map.iter() {
                        children.push(k);
                        children.push(v);
                    }
                }
                ObjData::Function(f) => children.extend_from_slice(&f.free_vals),
                ObjData::Str(_)
                | ObjData::Error(_)
                | ObjData::Native(_)
                | ObjData::External(_)
                | ObjData::Free => {}
            }
            for child in children.drain(..) {
                if let Some(ch) = child.as_handle() {
                    if let Some(slot) = self.slots.get_mut(ch.0 as usize) {
                        if !slot.marked {
                            slot.marked = true;
                            worklist.push(ch);
                        }
                    }
                }
            }
        }

        let mut freed = 0usize;
        for (ix, slot) in self.slots.iter_mut().enumerate() {
            if slot.marked || matches!(slot.data, ObjData::Free) {
                continue;
            }
            let dead = std::mem::take(&mut slot.data);
            recycle(&mut self.pools, dead);
            self.free.push(ix as u32);
            freed += 1;
        }
        self.allocs_since_sweep = 0;
        trace!(live = self.live_count(), freed, "gc sweep");
    }
}

fn recycle(pools: &mut RecyclePools, dead: ObjData) {
    match dead {
        ObjData::Array(mut a) => {
            if a.capacity() <= ARRAY_RECYCLE_MAX && pools.arrays.len() < POOL_MAX {
                a.clear();
                pools.arrays.push(a);
            }
        }
        ObjData::Map(mut m) => {
            if m.len() <= MAP_RECYCLE_MAX && pools.maps.len() < POOL_MAX {
                m.clear();
                pools.maps.push(m);
            }
        }
        ObjData::Str(s) => {
            if s.heap_capacity() > 0 && s.heap_capacity() <= STRING_RECYCLE_MAX {
                if let Some(mut buf) = s.into_heap_buffer() {
                    if pools.strings.len() < POOL_MAX {
                        buf.clear();
                        pools.strings.push(buf);
                    }
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_get() {
        let mut heap = Heap::new();
        let v = heap.alloc_string("hi");
        assert_eq!(heap.str_value(v).map(|s| s.as_str()), Some("hi"));
        assert_eq!(heap.live_count(), 1);
    }

    #[test]
    fn test_collect_frees_unreachable() {
        let mut heap = Heap::new();
        let keep = heap.alloc_string("keep");
        let _drop = heap.alloc_string("drop");
        heap.collect(&[keep]);
        assert_eq!(heap.live_count(), 1);
        assert_eq!(heap.str_value(keep).map(|s| s.as_str()), Some("keep"));
    }

    #[test]
    fn test_collect_marks_transitively() {
        let mut heap = Heap::new();
        let inner = heap.alloc_string("inner");
        let arr = heap.alloc(ObjData::Array(vec![inner]));
        heap.collect(&[arr]);
        assert_eq!(heap.live_count(), 2);
        assert!(heap.is_marked(inner.as_handle().unwrap()));
        assert!(heap.is_marked(arr.as_handle().unwrap()));
    }

    #[test]
    fn test_collect_handles_cycles() {
        let mut heap = Heap::new();
        let arr = heap.alloc(ObjData::Array(Vec::new()));
        let h = arr.as_handle().unwrap();
        if let ObjData::Array(items) = heap.get_mut(h) {
            items.push(arr);
        }
        heap.collect(&[arr]);
        assert_eq!(heap.live_count(), 1);
        heap.collect(&[]);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_double_sweep_is_noop() {
        let mut heap = Heap::new();
        let keep = heap.alloc_string("keep");
        heap.alloc_string("drop");
        heap.collect(&[keep]);
        let live = heap.live_count();
        heap.collect(&[keep]);
        assert_eq!(heap.live_count(), live);
    }

    #[test]
    fn test_pinned_survive() {
        let mut heap = Heap::new();
        let v = heap.alloc_string("pinned");
        heap.pin(v);
        heap.collect(&[]);
        assert_eq!(heap.live_count(), 1);
        heap.unpin(v);
        heap.collect(&[]);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_slot_reuse_after_sweep() {
        let mut heap = Heap::new();
        let a = heap.alloc_string("a");
        let a_ix = a.as_handle().unwrap().index();
        heap.collect(&[]);
        let b = heap.alloc_string("b");
        assert_eq!(b.as_handle().unwrap().index(), a_ix);
    }

    #[test]
    fn test_sweep_threshold() {
        let mut heap = Heap::new();
        assert!(!heap.should_collect());
        for _ in 0..=SWEEP_THRESHOLD {
            heap.alloc(ObjData::Array(Vec::new()));
        }
        assert!(heap.should_collect());
        heap.collect(&[]);
        assert!(!heap.should_collect());
    }
}
