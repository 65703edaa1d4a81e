//! Object arena with a free list, byte accounting and the intern set.
//!
//! The heap only knows about objects and their outgoing references; root
//! enumeration and collection policy live on `Vm` (see `gc.rs`).

use super::object::{
    hash_bytes, HeapObject, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjGenerator,
    ObjInstance, ObjList, ObjModule, ObjNative, ObjStackTrace, ObjString, ObjTable, ObjTuple, Object,
};
use super::table::{StrKey, Table};
use super::upvalue::Upvalue;
use super::value::{ObjRef, Value};

/// Statistics about GC activity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Number of collections performed
    pub collections: u64,
    /// Total objects allocated
    pub total_allocated: u64,
    /// Total objects freed
    pub total_freed: u64,
    /// Total bytes freed
    pub total_bytes_freed: u64,
    /// Interned strings dropped by the weak sweep
    pub interned_freed: u64,
    /// Peak heap size in bytes
    pub peak_bytes: usize,
}

/// Outcome of one collection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Collection {
    pub freed: usize,
    pub bytes_freed: usize,
    pub interned_freed: usize,
}

pub struct Heap {
    objects: Vec<Option<HeapObject>>,
    free_list: Vec<u32>,
    /// Every interned string, values unused.
    strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    first_gc_threshold: usize,
    heap_grow_rate: f64,
    max_heap_bytes: Option<usize>,
    /// Nesting depth of `disable_gc` windows.
    disabled: u32,
    stats: GcStats,
}

macro_rules! accessors {
    ($($get:ident, $get_mut:ident => $variant:ident($ty:ty);)*) => {
        $(
            pub fn $get(&self, r: ObjRef) -> Option<&$ty> {
                match self.get(r) {
                    Object::$variant(o) => Some(o),
                    _ => None,
                }
            }

            pub fn $get_mut(&mut self, r: ObjRef) -> Option<&mut $ty> {
                match self.get_mut(r) {
                    Object::$variant(o) => Some(o),
                    _ => None,
                }
            }
        )*
    };
}

impl Heap {
    pub fn new(first_gc_threshold: usize, heap_grow_rate: f64, max_heap_bytes: Option<usize>) -> Self {
        Self {
            objects: Vec::with_capacity(1024),
            free_list: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: first_gc_threshold,
            first_gc_threshold,
            heap_grow_rate,
            max_heap_bytes,
            disabled: 0,
            stats: GcStats::default(),
        }
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    pub fn live_objects(&self) -> usize {
        self.objects.len() - self.free_list.len()
    }

    pub fn interned_count(&self) -> usize {
        self.strings.len()
    }

    pub fn is_live(&self, r: ObjRef) -> bool {
        matches!(self.objects.get(r.index()), Some(Some(_)))
    }

    // --- GC window ---

    pub fn disable_gc(&mut self) {
        self.disabled += 1;
    }

    pub fn enable_gc(&mut self) {
        self.disabled = self.disabled.saturating_sub(1);
    }

    pub fn gc_enabled(&self) -> bool {
        self.disabled == 0
    }

    /// A collection is due before the next allocation.
    pub fn should_collect(&self) -> bool {
        self.disabled == 0 && self.bytes_allocated > self.next_gc
    }

    /// Allocating `size` more bytes would pass the hard ceiling.
    pub fn exceeds_limit(&self, size: usize) -> bool {
        self.max_heap_bytes
            .is_some_and(|max| self.bytes_allocated + size > max)
    }

    // --- Allocation ---

    /// Place `kind` in the arena. Never collects; callers decide that.
    pub fn insert(&mut self, kind: Object) -> ObjRef {
        let size = kind.estimate_size();
        let object = HeapObject {
            marked: false,
            size,
            kind,
        };
        self.bytes_allocated += size;
        self.stats.total_allocated += 1;
        self.stats.peak_bytes = self.stats.peak_bytes.max(self.bytes_allocated);

        if let Some(index) = self.free_list.pop() {
            self.objects[index as usize] = Some(object);
            ObjRef::new(index as usize)
        } else {
            self.objects.push(Some(object));
            ObjRef::new(self.objects.len() - 1)
        }
    }

    /// Re-estimate an object's size after it grew in place (list append,
    /// field insert).
    pub fn resize(&mut self, r: ObjRef) {
        if let Some(Some(object)) = self.objects.get_mut(r.index()) {
            let size = object.kind.estimate_size();
            self.bytes_allocated = (self.bytes_allocated + size).saturating_sub(object.size);
            object.size = size;
        }
    }

    /// An interned string: the existing handle if the content is already
    /// in the set, otherwise a new object.
    pub fn intern(&mut self, bytes: &[u8]) -> ObjRef {
        let hash = hash_bytes(bytes);
        if let Some(existing) = self.find_interned(bytes, hash) {
            return existing;
        }
        let r = self.insert(Object::String(ObjString {
            data: bytes.into(),
            hash,
            interned: true,
        }));
        self.strings.put(StrKey::new(r, hash), Value::Null);
        r
    }

    /// Look an interned string up by content without allocating.
    pub fn find_interned(&self, bytes: &[u8], hash: u32) -> Option<ObjRef> {
        let objects = &self.objects;
        self.strings.find_string(bytes, hash, |r| {
            match objects.get(r.index()).and_then(Option::as_ref) {
                Some(HeapObject {
                    kind: Object::String(s),
                    ..
                }) => &s.data[..],
                _ => &[],
            }
        })
    }

    /// A fresh string outside the intern set (concatenation results).
    pub fn new_string(&mut self, data: Vec<u8>) -> ObjRef {
        let hash = hash_bytes(&data);
        self.insert(Object::String(ObjString {
            data: data.into_boxed_slice(),
            hash,
            interned: false,
        }))
    }

    /// Table key for a string handle. Non-interned strings are interned
    /// first so the key's identity matches its content.
    pub fn key_of(&mut self, r: ObjRef) -> Option<StrKey> {
        let (interned, hash) = match self.string(r) {
            Some(s) => (s.interned, s.hash),
            None => return None,
        };
        if interned {
            return Some(StrKey::new(r, hash));
        }
        let data = self.string(r).map(|s| s.data.to_vec()).unwrap_or_default();
        Some(StrKey::new(self.intern(&data), hash))
    }

    /// Table key for `name`, interning it if needed.
    pub fn intern_key(&mut self, name: &str) -> StrKey {
        let r = self.intern(name.as_bytes());
        StrKey::new(r, hash_bytes(name.as_bytes()))
    }

    /// Table key for `name` if it is already interned. Lookups use this so
    /// a miss allocates nothing.
    pub fn lookup_key(&self, name: &str) -> Option<StrKey> {
        let hash = hash_bytes(name.as_bytes());
        self.find_interned(name.as_bytes(), hash)
            .map(|r| StrKey::new(r, hash))
    }

    // --- Access ---

    /// The object behind `r`. A dangling handle is a VM defect.
    pub fn get(&self, r: ObjRef) -> &Object {
        match self.objects.get(r.index()).and_then(Option::as_ref) {
            Some(object) => &object.kind,
            None => panic!("dangling object handle {:?}", r),
        }
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Object {
        match self.objects.get_mut(r.index()).and_then(Option::as_mut) {
            Some(object) => &mut object.kind,
            None => panic!("dangling object handle {:?}", r),
        }
    }

    accessors! {
        string, string_mut => String(ObjString);
        list, list_mut => List(ObjList);
        tuple, tuple_mut => Tuple(ObjTuple);
        table, table_mut => Table(ObjTable);
        function, function_mut => Function(ObjFunction);
        closure, closure_mut => Closure(ObjClosure);
        native, native_mut => Native(ObjNative);
        class, class_mut => Class(ObjClass);
        instance, instance_mut => Instance(ObjInstance);
        bound_method, bound_method_mut => BoundMethod(ObjBoundMethod);
        module, module_mut => Module(ObjModule);
        stack_trace, stack_trace_mut => StackTrace(ObjStackTrace);
        generator, generator_mut => Generator(ObjGenerator);
        upvalue, upvalue_mut => Upvalue(Upvalue);
    }

    /// The string behind a value, if it is one.
    pub fn value_string(&self, value: Value) -> Option<&ObjString> {
        value.as_obj().and_then(|r| self.string(r))
    }

    // --- Collection ---

    /// Mark everything reachable from `roots`, drop dead intern entries,
    /// then free every unmarked object.
    pub fn collect(&mut self, roots: Vec<ObjRef>) -> Collection {
        self.mark(roots);

        let objects = &self.objects;
        let interned_freed = self.strings.remove_unmarked(|r| {
            matches!(objects.get(r.index()), Some(Some(o)) if o.marked)
        });

        let (freed, bytes_freed) = self.sweep();
        self.next_gc = ((self.bytes_allocated as f64 * self.heap_grow_rate) as usize)
            .max(self.first_gc_threshold);

        self.stats.collections += 1;
        self.stats.total_freed += freed as u64;
        self.stats.total_bytes_freed += bytes_freed as u64;
        self.stats.interned_freed += interned_freed as u64;

        Collection {
            freed,
            bytes_freed,
            interned_freed,
        }
    }

    fn mark(&mut self, mut worklist: Vec<ObjRef>) {
        while let Some(r) = worklist.pop() {
            if let Some(Some(object)) = self.objects.get_mut(r.index()) {
                if !object.marked {
                    object.marked = true;
                    object.kind.trace(&mut worklist);
                }
            }
        }
    }

    fn sweep(&mut self) -> (usize, usize) {
        let mut freed = 0;
        let mut bytes_freed = 0;
        for (index, slot) in self.objects.iter_mut().enumerate() {
            match slot {
                Some(object) if object.marked => object.marked = false,
                Some(object) => {
                    bytes_freed += object.size;
                    freed += 1;
                    *slot = None;
                    self.free_list.push(index as u32);
                }
                None => {}
            }
        }
        self.bytes_allocated -= bytes_freed.min(self.bytes_allocated);
        (freed, bytes_freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn heap() -> Heap {
        Heap::new(1024, 2.0, None)
    }

    #[test]
    fn test_intern_shares_handle() {
        let mut heap = heap();
        let a = heap.intern(b"hello");
        let b = heap.intern(b"hello");
        let c = heap.intern(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.interned_count(), 2);
        assert_eq!(heap.live_objects(), 2);
    }

    #[test]
    fn test_lookup_key_does_not_allocate() {
        let mut heap = heap();
        assert_eq!(heap.lookup_key("name"), None);
        assert_eq!(heap.live_objects(), 0);
        let key = heap.intern_key("name");
        assert_eq!(heap.lookup_key("name"), Some(key));
    }

    #[test]
    fn test_collect_frees_unreachable() {
        let mut heap = heap();
        let kept = heap.insert(Object::List(ObjList::default()));
        let item = heap.new_string(b"item".to_vec());
        if let Some(list) = heap.list_mut(kept) {
            list.items.push(Value::Obj(item));
        }
        let garbage = heap.insert(Object::List(ObjList::default()));

        let result = heap.collect(vec![kept]);
        assert_eq!(result.freed, 1);
        assert!(heap.is_live(kept));
        assert!(heap.is_live(item));
        assert!(!heap.is_live(garbage));

        // The freed slot is reused.
        let reused = heap.insert(Object::List(ObjList::default()));
        assert_eq!(reused, garbage);
    }

    #[test]
    fn test_weak_intern_sweep() {
        let mut heap = heap();
        let kept = heap.intern(b"kept");
        heap.intern(b"dropped");
        let result = heap.collect(vec![kept]);
        assert_eq!(result.interned_freed, 1);
        assert_eq!(heap.interned_count(), 1);
        assert_eq!(heap.find_interned(b"dropped", hash_bytes(b"dropped")), None);

        // Re-interning after the sweep makes a fresh object.
        let again = heap.intern(b"dropped");
        assert!(heap.is_live(again));
        assert_eq!(heap.intern(b"kept"), kept);
    }

    #[test]
    fn test_cycles_are_collected() {
        let mut heap = heap();
        let a = heap.insert(Object::List(ObjList::default()));
        let b = heap.insert(Object::List(ObjList { items: vec![Value::Obj(a)] }));
        if let Some(list) = heap.list_mut(a) {
            list.items.push(Value::Obj(b));
        }
        assert_eq!(heap.collect(Vec::new()).freed, 2);
        assert_eq!(heap.bytes_allocated(), 0);
    }

    #[test]
    fn test_gc_window_nests() {
        let mut heap = Heap::new(0, 2.0, None);
        heap.insert(Object::List(ObjList::default()));
        assert!(heap.should_collect());
        heap.disable_gc();
        heap.disable_gc();
        heap.enable_gc();
        assert!(!heap.should_collect());
        heap.enable_gc();
        assert!(heap.should_collect());
    }

    #[test]
    fn test_next_gc_floor() {
        let mut heap = heap();
        heap.insert(Object::List(ObjList::default()));
        heap.collect(Vec::new());
        assert_eq!(heap.next_gc(), 1024);
        assert_eq!(heap.stats().collections, 1);
    }
}
