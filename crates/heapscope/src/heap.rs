//! Arena heap standing in for a scripting host.
//!
//! Objects live in slots addressed by [`ObjId`]; a freed slot is reused with a
//! bumped generation so stale handles stop resolving. Collection is a full
//! mark and sweep from the global object and any pinned handles.

use heapscope_types::{ObjectAddress, ObjectCount, ObjectLocation};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::census::{HeapCensus, HeapHost};
use crate::graph::{NodeKind, ObjectGraph, Property, Slot};
use crate::resolver::{ResolveOutcome, ResolverConfig, resolve_with_stats};

const HEAP_BASE: u64 = 0x7f3a_0000_0000;
const OBJECT_STRIDE: u64 = 0x20;

pub const GLOBAL_CLASS: &str = "Window";
pub const ARRAY_CLASS: &str = "Array";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjId {
    index: u32,
    generation: u32,
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}g{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Ref(ObjId),
}

impl From<ObjId> for Value {
    fn from(id: ObjId) -> Self {
        Self::Ref(id)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    StaleHandle(ObjId),
    NotASequence(ObjId),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaleHandle(id) => write!(f, "object {id} is no longer live"),
            Self::NotASequence(id) => write!(f, "object {id} is not a sequence"),
        }
    }
}

impl std::error::Error for HeapError {}

struct HeapObject {
    class_name: String,
    location: String,
    kind: NodeKind,
    serial: u64,
    properties: Vec<(String, Value)>,
    /// Next index a sequence push will use. Never reused after a remove.
    next_index: u64,
}

impl HeapObject {
    fn note_index_key(&mut self, key: &str) {
        if self.kind != NodeKind::Sequence {
            return;
        }
        if let Ok(index) = key.parse::<u64>() {
            self.next_index = self.next_index.max(index.saturating_add(1));
        }
    }
}

pub struct ScriptHeap {
    objects: Vec<Option<HeapObject>>,
    generations: Vec<u32>,
    marks: Vec<bool>,
    free_list: Vec<u32>,
    gray_queue: Vec<ObjId>,
    pinned: Vec<ObjId>,
    next_serial: u64,
    global: ObjId,
}

impl ScriptHeap {
    pub fn new() -> Self {
        let mut heap = Self {
            objects: Vec::new(),
            generations: Vec::new(),
            marks: Vec::new(),
            free_list: Vec::new(),
            gray_queue: Vec::new(),
            pinned: Vec::new(),
            next_serial: 0,
            global: ObjId {
                index: 0,
                generation: 0,
            },
        };
        heap.global = heap.alloc(GLOBAL_CLASS, "<global>", NodeKind::Record);
        heap
    }

    /// The root object every collection starts from.
    pub fn global(&self) -> ObjId {
        self.global
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    pub fn alloc(
        &mut self,
        class_name: impl Into<String>,
        location: impl Into<String>,
        kind: NodeKind,
    ) -> ObjId {
        let object = HeapObject {
            class_name: class_name.into(),
            location: location.into(),
            kind,
            serial: self.next_serial,
            properties: Vec::new(),
            next_index: 0,
        };
        self.next_serial += 1;

        if let Some(idx) = self.free_list.pop() {
            let i = idx as usize;
            self.generations[i] = self.generations[i].wrapping_add(1);
            self.objects[i] = Some(object);
            self.marks[i] = false;
            ObjId {
                index: idx,
                generation: self.generations[i],
            }
        } else {
            let idx = self.objects.len() as u32;
            self.objects.push(Some(object));
            self.generations.push(0);
            self.marks.push(false);
            ObjId {
                index: idx,
                generation: 0,
            }
        }
    }

    /// Allocates a record labelled with the caller's source location.
    #[track_caller]
    pub fn alloc_here(&mut self, class_name: impl Into<String>) -> ObjId {
        let caller = std::panic::Location::caller();
        let location = format!("{}:{}", caller.file(), caller.line());
        self.alloc(class_name, location, NodeKind::Record)
    }

    /// Allocates an empty array labelled with the caller's source location.
    #[track_caller]
    pub fn alloc_array_here(&mut self) -> ObjId {
        let caller = std::panic::Location::caller();
        let location = format!("{}:{}", caller.file(), caller.line());
        self.alloc(ARRAY_CLASS, location, NodeKind::Sequence)
    }

    // -----------------------------------------------------------------------
    // Object access
    // -----------------------------------------------------------------------

    fn get(&self, id: ObjId) -> Option<&HeapObject> {
        let i = id.index as usize;
        if self.generations.get(i) != Some(&id.generation) {
            return None;
        }
        self.objects.get(i)?.as_ref()
    }

    fn get_mut(&mut self, id: ObjId) -> Result<&mut HeapObject, HeapError> {
        let i = id.index as usize;
        if self.generations.get(i) != Some(&id.generation) {
            return Err(HeapError::StaleHandle(id));
        }
        self.objects
            .get_mut(i)
            .and_then(Option::as_mut)
            .ok_or(HeapError::StaleHandle(id))
    }

    pub fn is_live(&self, id: ObjId) -> bool {
        self.get(id).is_some()
    }

    pub fn class_name(&self, id: ObjId) -> Option<&str> {
        self.get(id).map(|object| object.class_name.as_str())
    }

    pub fn address_of(&self, id: ObjId) -> Option<ObjectAddress> {
        self.get(id).map(|object| address_for_serial(object.serial))
    }

    /// Finds the live object currently at `address`.
    pub fn find_by_address(&self, address: ObjectAddress) -> Option<ObjId> {
        self.live_ids()
            .find(|(_, object)| address_for_serial(object.serial) == address)
            .map(|(id, _)| id)
    }

    /// Sets `key`, replacing an existing value in place or appending.
    ///
    /// Setting a numeric key on a sequence moves its next push index past it.
    pub fn set(&mut self, id: ObjId, key: &str, value: impl Into<Value>) -> Result<(), HeapError> {
        let value = value.into();
        let object = self.get_mut(id)?;
        match object.properties.iter_mut().find(|(k, _)| k == key) {
            Some((_, slot)) => *slot = value,
            None => {
                object.note_index_key(key);
                object.properties.push((key.to_string(), value));
            }
        }
        Ok(())
    }

    /// Appends to a sequence under the next unused index key.
    pub fn push(&mut self, id: ObjId, value: impl Into<Value>) -> Result<(), HeapError> {
        let value = value.into();
        let object = self.get_mut(id)?;
        if object.kind != NodeKind::Sequence {
            return Err(HeapError::NotASequence(id));
        }
        let key = object.next_index.to_string();
        object.next_index += 1;
        object.properties.push((key, value));
        Ok(())
    }

    pub fn remove(&mut self, id: ObjId, key: &str) -> Result<Option<Value>, HeapError> {
        let object = self.get_mut(id)?;
        let Some(pos) = object.properties.iter().position(|(k, _)| k == key) else {
            return Ok(None);
        };
        Ok(Some(object.properties.remove(pos).1))
    }

    pub fn get_property(&self, id: ObjId, key: &str) -> Option<&Value> {
        self.get(id)?
            .properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value)
    }

    /// Keeps `id` alive across collections until a matching [`unpin`].
    ///
    /// [`unpin`]: ScriptHeap::unpin
    pub fn pin(&mut self, id: ObjId) {
        self.pinned.push(id);
    }

    pub fn unpin(&mut self, id: ObjId) -> bool {
        match self.pinned.iter().position(|pinned| *pinned == id) {
            Some(pos) => {
                self.pinned.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn live_count(&self) -> usize {
        self.objects.iter().filter(|slot| slot.is_some()).count()
    }

    fn live_ids(&self) -> impl Iterator<Item = (ObjId, &HeapObject)> {
        self.objects.iter().enumerate().filter_map(|(i, slot)| {
            slot.as_ref().map(|object| {
                (
                    ObjId {
                        index: i as u32,
                        generation: self.generations[i],
                    },
                    object,
                )
            })
        })
    }

    /// Live objects in allocation order.
    fn live_in_allocation_order(&self) -> Vec<&HeapObject> {
        let mut live: Vec<&HeapObject> = self.live_ids().map(|(_, object)| object).collect();
        live.sort_by_key(|object| object.serial);
        live
    }

    // -----------------------------------------------------------------------
    // Census
    // -----------------------------------------------------------------------

    /// Live instance counts per class, classes in order of first allocation.
    pub fn census_counts(&self) -> Vec<ObjectCount> {
        let mut counts: Vec<ObjectCount> = Vec::new();
        let mut by_class: HashMap<&str, usize> = HashMap::new();
        for object in self.live_in_allocation_order() {
            match by_class.get(object.class_name.as_str()) {
                Some(&pos) => counts[pos].count += 1,
                None => {
                    by_class.insert(object.class_name.as_str(), counts.len());
                    counts.push(ObjectCount {
                        type_name: object.class_name.clone(),
                        count: 1,
                    });
                }
            }
        }
        counts
    }

    pub fn census_objects(&self, type_name: &str) -> Vec<ObjectLocation> {
        self.live_in_allocation_order()
            .into_iter()
            .filter(|object| object.class_name == type_name)
            .map(|object| ObjectLocation {
                type_name: object.class_name.clone(),
                location: object.location.clone(),
                address: address_for_serial(object.serial),
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Collection
    // -----------------------------------------------------------------------

    /// Frees everything unreachable from the global object and pinned
    /// handles. Returns the number of objects freed.
    pub fn collect(&mut self) -> usize {
        for m in self.marks.iter_mut() {
            *m = false;
        }
        self.gray_queue.clear();
        self.gray_queue.push(self.global);
        self.gray_queue.extend(self.pinned.iter().copied());

        self.mark_all();
        let freed = self.sweep_all();
        debug!(freed, live = self.live_count(), "heap collection finished");
        freed
    }

    fn mark_all(&mut self) {
        while let Some(id) = self.gray_queue.pop() {
            let i = id.index as usize;
            if i >= self.marks.len() || self.marks[i] {
                continue;
            }
            if self.generations[i] != id.generation {
                continue;
            }
            let Some(object) = self.objects[i].as_ref() else {
                continue;
            };
            self.marks[i] = true;
            for (_, value) in &object.properties {
                if let Value::Ref(child) = value {
                    self.gray_queue.push(*child);
                }
            }
        }
    }

    fn sweep_all(&mut self) -> usize {
        let mut freed = 0;
        for i in 0..self.objects.len() {
            if self.objects[i].is_some() && !self.marks[i] {
                self.objects[i] = None;
                self.free_list.push(i as u32);
                freed += 1;
            }
        }
        freed
    }
}

impl Default for ScriptHeap {
    fn default() -> Self {
        Self::new()
    }
}

fn address_for_serial(serial: u64) -> ObjectAddress {
    ObjectAddress::new(HEAP_BASE.wrapping_add(serial.wrapping_mul(OBJECT_STRIDE)))
}

impl ObjectGraph for ScriptHeap {
    type Node = ObjId;

    fn address(&self, node: ObjId) -> ObjectAddress {
        self.address_of(node).unwrap_or(ObjectAddress::new(0))
    }

    fn kind(&self, node: ObjId) -> NodeKind {
        self.get(node)
            .map(|object| object.kind)
            .unwrap_or(NodeKind::Record)
    }

    fn properties(&self, node: ObjId) -> Vec<Property<ObjId>> {
        let Some(object) = self.get(node) else {
            return Vec::new();
        };
        object
            .properties
            .iter()
            .map(|(key, value)| Property::new(key.clone(), slot_of(value)))
            .collect()
    }

    fn property(&self, node: ObjId, key: &str) -> Option<Slot<ObjId>> {
        self.get_property(node, key).map(slot_of)
    }
}

fn slot_of(value: &Value) -> Slot<ObjId> {
    match value {
        Value::Null => Slot::Null,
        Value::Ref(id) => Slot::Object(*id),
        Value::Bool(_) | Value::Number(_) | Value::Str(_) => Slot::Scalar,
    }
}

/// A [`ScriptHeap`] shared between the host and the introspection service.
///
/// Census and path resolution take the read lock; collection takes the write
/// lock, so a resolution never observes a half-swept heap.
#[derive(Clone, Default)]
pub struct SharedHeap {
    inner: Arc<RwLock<ScriptHeap>>,
}

impl SharedHeap {
    pub fn new(heap: ScriptHeap) -> Self {
        Self {
            inner: Arc::new(RwLock::new(heap)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ScriptHeap> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ScriptHeap> {
        self.inner.write()
    }

    pub fn global(&self) -> ObjId {
        self.inner.read().global()
    }
}

impl HeapCensus for SharedHeap {
    fn object_counts(&self) -> Vec<ObjectCount> {
        self.inner.read().census_counts()
    }

    fn objects_of_type(&self, type_name: &str) -> Vec<ObjectLocation> {
        self.inner.read().census_objects(type_name)
    }

    fn collect_garbage(&self) {
        self.inner.write().collect();
    }
}

impl HeapHost for SharedHeap {
    type Root = ObjId;

    fn find_path(
        &self,
        root: ObjId,
        target: ObjectAddress,
        config: &ResolverConfig,
    ) -> ResolveOutcome {
        let heap = self.inner.read();
        resolve_with_stats(&*heap, root, target, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::resolve;

    #[test]
    fn collect_unreachable() {
        let mut heap = ScriptHeap::new();
        let kept = heap.alloc_here("Foo");
        heap.alloc_here("Foo");
        heap.set(heap.global(), "kept", kept).expect("global is live");

        assert_eq!(heap.collect(), 1);
        assert!(heap.is_live(kept));
        assert_eq!(heap.live_count(), 2);
    }

    #[test]
    fn collect_cycle() {
        let mut heap = ScriptHeap::new();
        let a = heap.alloc_here("Node");
        let b = heap.alloc_here("Node");
        heap.set(a, "next", b).expect("a is live");
        heap.set(b, "next", a).expect("b is live");

        assert_eq!(heap.collect(), 2);
        assert!(!heap.is_live(a));
        assert!(!heap.is_live(b));
    }

    #[test]
    fn pinned_objects_survive_until_unpinned() {
        let mut heap = ScriptHeap::new();
        let held = heap.alloc_here("Listener");
        heap.pin(held);
        assert_eq!(heap.collect(), 0);
        assert!(heap.unpin(held));
        assert!(!heap.unpin(held));
        assert_eq!(heap.collect(), 1);
    }

    #[test]
    fn reused_slot_gets_new_generation_and_address() {
        let mut heap = ScriptHeap::new();
        let first = heap.alloc_here("Foo");
        let first_address = heap.address_of(first).expect("live");
        heap.collect();

        let second = heap.alloc_here("Foo");
        assert_ne!(first, second);
        assert!(!heap.is_live(first));
        assert_eq!(
            heap.set(first, "x", 1.0),
            Err(HeapError::StaleHandle(first))
        );
        assert_ne!(heap.address_of(second), Some(first_address));
        assert_eq!(heap.find_by_address(first_address), None);
    }

    #[test]
    fn census_groups_by_class_in_allocation_order() {
        let mut heap = ScriptHeap::new();
        let global = heap.global();
        let foo = heap.alloc("Foo", "main.js:1", NodeKind::Record);
        let bar = heap.alloc("Bar", "main.js:2", NodeKind::Record);
        let foo2 = heap.alloc("Foo", "main.js:3", NodeKind::Record);
        heap.set(global, "foo", foo).expect("global is live");
        heap.set(global, "bar", bar).expect("global is live");
        heap.set(global, "foo2", foo2).expect("global is live");

        let counts = heap.census_counts();
        let pairs: Vec<(&str, i64)> = counts
            .iter()
            .map(|c| (c.type_name.as_str(), c.count))
            .collect();
        assert_eq!(pairs, [("Window", 1), ("Foo", 2), ("Bar", 1)]);

        let foos = heap.census_objects("Foo");
        assert_eq!(foos.len(), 2);
        assert_eq!(foos[0].location, "main.js:1");
        assert_eq!(foos[1].location, "main.js:3");
        assert_eq!(heap.address_of(foo), Some(foos[0].address));
        assert!(heap.census_objects("Missing").is_empty());
    }

    #[test]
    fn alloc_here_records_the_call_site() {
        let mut heap = ScriptHeap::new();
        let id = heap.alloc_here("Foo");
        let objects = heap.census_objects("Foo");
        assert_eq!(objects.len(), 1);
        assert!(
            objects[0].location.contains("heap.rs:"),
            "unexpected location {}",
            objects[0].location
        );
        assert_eq!(heap.address_of(id), Some(objects[0].address));
    }

    #[test]
    fn push_rejects_records_and_indexes_sequences() {
        let mut heap = ScriptHeap::new();
        let list = heap.alloc_array_here();
        let record = heap.alloc_here("Foo");
        heap.push(list, record).expect("list is a sequence");
        heap.push(list, Value::Null).expect("list is a sequence");
        assert_eq!(heap.get_property(list, "0"), Some(&Value::Ref(record)));
        assert_eq!(heap.get_property(list, "1"), Some(&Value::Null));
        assert_eq!(
            heap.push(record, 1.0),
            Err(HeapError::NotASequence(record))
        );
    }

    #[test]
    fn push_after_remove_never_reuses_an_index() {
        let mut heap = ScriptHeap::new();
        let root = heap.global();
        let list = heap.alloc_array_here();
        heap.set(root, "list", list).expect("live");
        for _ in 0..3 {
            let item = heap.alloc_here("Item");
            heap.push(list, item).expect("sequence");
        }
        heap.remove(list, "0").expect("live");
        let d = heap.alloc_here("Item");
        heap.push(list, d).expect("sequence");

        let keys: Vec<String> = heap.properties(list).into_iter().map(|p| p.key).collect();
        assert_eq!(keys, ["1", "2", "3"]);

        let address = heap.address_of(d).expect("d is live");
        let path = resolve(&heap, root, address, &ResolverConfig::default()).expect("found");
        assert_eq!(path.to_string(), "window.list[3]");
        assert_eq!(path.follow(&heap, root), Some(d));

        heap.set(list, "7", Value::Null).expect("live");
        heap.push(list, 1.0).expect("sequence");
        assert_eq!(heap.get_property(list, "8"), Some(&Value::Number(1.0)));
    }

    #[test]
    fn set_replaces_in_place_and_remove_detaches() {
        let mut heap = ScriptHeap::new();
        let obj = heap.alloc_here("Foo");
        heap.set(obj, "a", 1.0).expect("live");
        heap.set(obj, "b", 2.0).expect("live");
        heap.set(obj, "a", "again").expect("live");
        let keys: Vec<String> = heap.properties(obj).into_iter().map(|p| p.key).collect();
        assert_eq!(keys, ["a", "b"]);
        assert_eq!(heap.remove(obj, "a").expect("live"), Some(Value::from("again")));
        assert_eq!(heap.remove(obj, "a").expect("live"), None);
    }

    #[test]
    fn shared_heap_resolves_through_the_host_capability() {
        let shared = SharedHeap::default();
        let (root, x) = {
            let mut heap = shared.write();
            let root = heap.global();
            let a = heap.alloc_here("A");
            heap.set(a, "b", 1.0).expect("live");
            let c = heap.alloc_array_here();
            let c0 = heap.alloc_here("Item");
            let c1 = heap.alloc_here("Item");
            let x = heap.alloc_here("X");
            heap.set(c1, "x", x).expect("live");
            heap.push(c, c0).expect("sequence");
            heap.push(c, c1).expect("sequence");
            heap.set(root, "a", a).expect("live");
            heap.set(root, "c", c).expect("live");
            (root, x)
        };
        let address = shared.read().address_of(x).expect("x is live");
        let outcome = shared.find_path(root, address, &ResolverConfig::default());
        assert_eq!(outcome.path_string(), "window.c[1].x");

        let heap = shared.read();
        let path = resolve(&*heap, root, address, &ResolverConfig::default()).expect("found");
        assert_eq!(path.follow(&*heap, root), Some(x));
    }

    #[test]
    fn shared_heap_census_drops_after_collection() {
        let shared = SharedHeap::default();
        {
            let mut heap = shared.write();
            let global = heap.global();
            let kept = heap.alloc_here("Foo");
            heap.alloc_here("Foo");
            heap.alloc_here("Foo");
            heap.set(global, "kept", kept).expect("live");
        }
        let count_of = |counts: Vec<ObjectCount>| {
            counts
                .into_iter()
                .find(|c| c.type_name == "Foo")
                .map(|c| c.count)
                .unwrap_or(0)
        };
        assert_eq!(count_of(shared.object_counts()), 3);
        shared.collect_garbage();
        assert_eq!(count_of(shared.object_counts()), 1);
    }
}
