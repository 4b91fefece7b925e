//! Heap object storage: an arena of generation-checked slots referenced by
//! [`Value::Heap`]. Allocation consults type-specific recycle pools before
//! falling back to the host allocator; collection is driven from
//! [`crate::gc`].

use crate::errors::Traceback;
use crate::string::HeapString;
use crate::value::{HeapRef, MapKey, Value};
use std::collections::HashMap;
use std::rc::Rc;

/// Compiled code shared by every closure created from the same function
/// literal. Immutable once constructed (§3.3). Constants are not stored here:
/// the whole compilation shares a single constant pool (see
/// `loom_compiler::compiler::CompiledProgram`), and every `Chunk` indexes
/// into it by the same `CONSTANT` opcode.
#[derive(Debug)]
pub struct Chunk {
    pub name: Option<String>,
    pub bytecode: crate::bytecode::Bytecode,
    pub num_locals: u16,
    pub num_params: u8,
}

#[derive(Debug, Clone)]
pub struct FunctionObject {
    pub chunk: Rc<Chunk>,
    /// Captured free values, snapshotted by value at closure construction.
    pub free_values: Vec<Value>,
}

pub type NativeFn = fn(&mut Heap, &[Value]) -> Result<Value, String>;

#[derive(Debug, Clone)]
pub struct NativeFunctionObject {
    pub name: HeapString,
    pub func: NativeFn,
}

#[derive(Debug, Clone)]
pub struct ErrorObject {
    pub message: HeapString,
    pub traceback: Option<Traceback>,
}

/// An opaque host-owned value. `destroy`/`copy` mirror the embedder contract
/// in SPEC_FULL.md §6; both are optional because most externals are simple
/// borrowed handles with no special lifecycle.
pub struct ExternalObject {
    pub data: *mut std::ffi::c_void,
    pub destroy: Option<fn(*mut std::ffi::c_void)>,
    pub copy: Option<fn(*mut std::ffi::c_void) -> *mut std::ffi::c_void>,
}

impl std::fmt::Debug for ExternalObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExternalObject({:p})", self.data)
    }
}

impl Clone for ExternalObject {
    fn clone(&self) -> Self {
        let data = match self.copy {
            Some(copy) => copy(self.data),
            None => self.data,
        };
        Self {
            data,
            destroy: self.destroy,
            copy: self.copy,
        }
    }
}

impl Drop for ExternalObject {
    fn drop(&mut self) {
        if let Some(destroy) = self.destroy {
            destroy(self.data);
        }
    }
}

/// An insertion-ordered map. Entries keep arrival order; `index` gives O(1)
/// lookup from key to position in `entries`.
#[derive(Debug, Clone, Default)]
pub struct OrderedMap {
    entries: Vec<(MapKey, Value)>,
    index: HashMap<MapKey, usize>,
}

impl OrderedMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &MapKey) -> Option<&Value> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    pub fn insert(&mut self, key: MapKey, value: Value) {
        if let Some(&i) = self.index.get(&key) {
            self.entries[i].1 = value;
        } else {
            self.index.insert(key.clone(), self.entries.len());
            self.entries.push((key, value));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(MapKey, Value)> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

#[derive(Debug, Clone)]
pub enum HeapObject {
    String(HeapString),
    Array(Vec<Value>),
    Map(OrderedMap),
    Function(FunctionObject),
    NativeFunction(NativeFunctionObject),
    Error(ErrorObject),
    External(Rc<ExternalObject>),
    /// Tombstone left behind by a sweep; must never be observed by running
    /// user code (§3.3).
    Freed,
}

impl HeapObject {
    pub fn type_name(&self) -> &'static str {
        match self {
            HeapObject::String(_) => "STRING",
            HeapObject::Array(_) => "ARRAY",
            HeapObject::Map(_) => "MAP",
            HeapObject::Function(_) => "FUNCTION",
            HeapObject::NativeFunction(_) => "NATIVE_FUNCTION",
            HeapObject::Error(_) => "ERROR",
            HeapObject::External(_) => "EXTERNAL",
            HeapObject::Freed => "FREED",
        }
    }
}

struct Slot {
    generation: u32,
    live: bool,
    marked: bool,
    object: HeapObject,
}

const ARRAY_POOL_CAP: usize = 2048;
const MAP_POOL_CAP: usize = 2048;
const OVERSIZED_ELEMENT_COUNT: usize = 1024;
const SWEEP_THRESHOLD: usize = 2048;

#[derive(Default)]
struct Pools {
    arrays: Vec<Vec<Value>>,
    maps: Vec<OrderedMap>,
}

/// Owns every heap object for one VM instance. Never shared across VMs
/// (mirrors §5's single-owner-thread rule at the data-structure level).
pub struct Heap {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    pins: std::collections::HashSet<u32>,
    pools: Pools,
    allocations_since_sweep: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            pins: std::collections::HashSet::new(),
            pools: Pools::default(),
            allocations_since_sweep: 0,
        }
    }

    /// Allocates a fresh slot for `object`, consulting the free list first.
    pub fn alloc_object_data(&mut self, object: HeapObject) -> HeapRef {
        self.allocations_since_sweep += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.live = true;
            slot.marked = false;
            slot.object = object;
            HeapRef {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                live: true,
                marked: false,
                object,
            });
            HeapRef {
                index,
                generation: 0,
            }
        }
    }

    /// Returns a recycled, empty array buffer if the pool has one.
    pub fn get_array_from_pool(&mut self) -> Vec<Value> {
        self.pools.arrays.pop().unwrap_or_default()
    }

    pub fn get_map_from_pool(&mut self) -> OrderedMap {
        self.pools.maps.pop().unwrap_or_default()
    }

    pub fn alloc_string(&mut self, s: impl Into<HeapString>) -> HeapRef {
        self.alloc_object_data(HeapObject::String(s.into()))
    }

    pub fn alloc_array(&mut self, items: Vec<Value>) -> HeapRef {
        self.alloc_object_data(HeapObject::Array(items))
    }

    pub fn alloc_map(&mut self, map: OrderedMap) -> HeapRef {
        self.alloc_object_data(HeapObject::Map(map))
    }

    pub fn alloc_function(&mut self, function: FunctionObject) -> HeapRef {
        self.alloc_object_data(HeapObject::Function(function))
    }

    pub fn alloc_native_function(&mut self, native: NativeFunctionObject) -> HeapRef {
        self.alloc_object_data(HeapObject::NativeFunction(native))
    }

    pub fn alloc_error(&mut self, error: ErrorObject) -> HeapRef {
        self.alloc_object_data(HeapObject::Error(error))
    }

    pub fn pin(&mut self, r: HeapRef) {
        self.pins.insert(r.index);
    }

    pub fn unpin(&mut self, r: HeapRef) {
        self.pins.remove(&r.index);
    }

    pub fn should_sweep(&self) -> bool {
        self.allocations_since_sweep > SWEEP_THRESHOLD
    }

    fn slot(&self, r: HeapRef) -> Option<&Slot> {
        self.slots.get(r.index as usize).filter(|s| s.live && s.generation == r.generation)
    }

    fn slot_mut(&mut self, r: HeapRef) -> Option<&mut Slot> {
        self.slots
            .get_mut(r.index as usize)
            .filter(|s| s.live && s.generation == r.generation)
    }

    pub fn get(&self, r: HeapRef) -> Option<&HeapObject> {
        self.slot(r).map(|s| &s.object)
    }

    pub fn get_mut(&mut self, r: HeapRef) -> Option<&mut HeapObject> {
        self.slot_mut(r).map(|s| &mut s.object)
    }

    pub fn value_to_map_key(&self, value: &Value) -> Option<MapKey> {
        match value {
            Value::Number(n) => Some(MapKey::Number(n.to_bits())),
            Value::Boolean(b) => Some(MapKey::Boolean(*b)),
            Value::Heap(r) => match self.get(*r) {
                Some(HeapObject::String(s)) => Some(MapKey::String(s.as_str().to_string())),
                _ => None,
            },
            Value::Null => None,
        }
    }

    // ---- mark-sweep ----

    fn mark(&mut self, value: Value) {
        let Value::Heap(r) = value else { return };
        let Some(slot) = self.slots.get_mut(r.index as usize) else {
            return;
        };
        if !slot.live || slot.generation != r.generation || slot.marked {
            return;
        }
        slot.marked = true;
        // Walk children after marking this node, to avoid infinite recursion
        // through a reference cycle.
        let children: Vec<Value> = match &slot.object {
            HeapObject::Array(items) => items.clone(),
            HeapObject::Map(map) => map.iter().map(|(_, v)| *v).collect(),
            HeapObject::Function(f) => f.free_values.clone(),
            _ => Vec::new(),
        };
        for child in children {
            self.mark(child);
        }
    }

    /// Marks every reachable object from `roots`, then sweeps anything left
    /// unmarked: recycled into a type-specific pool when small enough,
    /// otherwise dropped. Pinned objects are always retained.
    pub fn collect<I: IntoIterator<Item = Value>>(&mut self, roots: I) -> GcStats {
        for slot in &mut self.slots {
            slot.marked = false;
        }
        let pinned: Vec<HeapRef> = self
            .pins
            .iter()
            .map(|&index| HeapRef {
                index,
                generation: self.slots[index as usize].generation,
            })
            .collect();
        for r in pinned {
            self.mark(Value::Heap(r));
        }
        for root in roots {
            self.mark(root);
        }

        let mut marked = 0usize;
        let mut swept = 0usize;
        let mut recycled = 0usize;
        for index in 0..self.slots.len() {
            let live_and_marked = self.slots[index].live && self.slots[index].marked;
            if live_and_marked {
                marked += 1;
                continue;
            }
            if !self.slots[index].live {
                continue;
            }
            swept += 1;
            let object = std::mem::replace(&mut self.slots[index].object, HeapObject::Freed);
            match object {
                HeapObject::Array(mut items) if items.len() <= OVERSIZED_ELEMENT_COUNT => {
                    if self.pools.arrays.len() < ARRAY_POOL_CAP {
                        items.clear();
                        self.pools.arrays.push(items);
                        recycled += 1;
                    }
                }
                HeapObject::Map(mut map) if map.len() <= OVERSIZED_ELEMENT_COUNT => {
                    if self.pools.maps.len() < MAP_POOL_CAP {
                        map.clear();
                        self.pools.maps.push(map);
                        recycled += 1;
                    }
                }
                _ => {}
            }
            self.slots[index].live = false;
            self.slots[index].generation = self.slots[index].generation.wrapping_add(1);
            self.free_list.push(index as u32);
        }
        self.allocations_since_sweep = 0;
        GcStats {
            marked,
            swept,
            recycled,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub marked: usize,
    pub swept: usize,
    pub recycled: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_get_round_trip() {
        let mut heap = Heap::new();
        let r = heap.alloc_string("hello");
        match heap.get(r) {
            Some(HeapObject::String(s)) => assert_eq!(s.as_str(), "hello"),
            _ => panic!("expected string"),
        }
    }

    #[test]
    fn unreachable_object_is_swept() {
        let mut heap = Heap::new();
        let r = heap.alloc_string("garbage");
        let stats = heap.collect(std::iter::empty());
        assert_eq!(stats.swept, 1);
        assert!(heap.get(r).is_none());
    }

    #[test]
    fn rooted_object_survives_sweep() {
        let mut heap = Heap::new();
        let r = heap.alloc_string("kept");
        let stats = heap.collect([Value::Heap(r)]);
        assert_eq!(stats.marked, 1);
        assert!(heap.get(r).is_some());
    }

    #[test]
    fn pinned_object_survives_without_being_rooted() {
        let mut heap = Heap::new();
        let r = heap.alloc_string("pinned");
        heap.pin(r);
        heap.collect(std::iter::empty());
        assert!(heap.get(r).is_some());
    }

    #[test]
    fn reference_cycle_is_collected() {
        let mut heap = Heap::new();
        let a = heap.alloc_array(Vec::new());
        let b = heap.alloc_array(vec![Value::Heap(a)]);
        if let Some(HeapObject::Array(items)) = heap.get_mut(a) {
            items.push(Value::Heap(b));
        }
        // Neither is rooted, despite referencing each other.
        let stats = heap.collect(std::iter::empty());
        assert_eq!(stats.swept, 2);
    }

    #[test]
    fn stale_reference_after_recycle_is_not_dereferenceable() {
        let mut heap = Heap::new();
        let r = heap.alloc_string("first");
        heap.collect(std::iter::empty());
        let r2 = heap.alloc_string("second");
        assert_eq!(r.index, r2.index);
        assert_ne!(r.generation, r2.generation);
        assert!(heap.get(r).is_none());
        assert!(heap.get(r2).is_some());
    }

    #[test]
    fn map_insertion_order_preserved() {
        let mut map = OrderedMap::new();
        map.insert(MapKey::String("b".into()), Value::Number(2.0));
        map.insert(MapKey::String("a".into()), Value::Number(1.0));
        let keys: Vec<_> = map.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(
            keys,
            vec![MapKey::String("b".into()), MapKey::String("a".into())]
        );
    }
}
