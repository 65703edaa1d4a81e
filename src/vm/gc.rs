//! Collection policy and root enumeration.
//!
//! Every allocation made while the VM runs goes through [`Vm::alloc`] (or
//! the string helpers below). When the heap passes its threshold the
//! collector marks from the VM roots plus the children of the object being
//! allocated, then sweeps. Interned strings are weak: an unreachable one is
//! dropped from the intern set during the sweep.

use crate::logging::GC_TARGET;

use super::heap::{Collection, GcStats};
use super::object::{hash_bytes, Object};
use super::value::{ObjRef, Value};
use super::vm::Vm;

impl Vm {
    /// Allocate `object`, collecting first if the heap is over budget.
    pub(crate) fn alloc(&mut self, object: Object) -> ObjRef {
        let size = object.estimate_size();
        if self.heap.should_collect() || self.heap.exceeds_limit(size) {
            let mut pending = Vec::new();
            object.trace(&mut pending);
            self.collect_with(pending);
            self.check_limit(size);
        }
        self.heap.insert(object)
    }

    /// Interned string for `bytes`.
    pub(crate) fn intern(&mut self, bytes: &[u8]) -> ObjRef {
        if let Some(existing) = self.heap.find_interned(bytes, hash_bytes(bytes)) {
            return existing;
        }
        self.reserve(bytes.len());
        self.heap.intern(bytes)
    }

    /// String outside the intern set.
    pub(crate) fn new_string(&mut self, data: Vec<u8>) -> ObjRef {
        self.reserve(data.len());
        self.heap.new_string(data)
    }

    fn reserve(&mut self, size: usize) {
        if self.heap.should_collect() || self.heap.exceeds_limit(size) {
            self.collect_with(Vec::new());
            self.check_limit(size);
        }
    }

    fn check_limit(&self, size: usize) {
        if self.heap.exceeds_limit(size) {
            tracing::error!(
                target: GC_TARGET,
                requested = size,
                allocated = self.heap.bytes_allocated(),
                "out of memory: heap limit reached"
            );
            std::process::abort();
        }
    }

    /// Run a full collection now.
    pub fn collect_garbage(&mut self) -> Collection {
        self.collect_with(Vec::new())
    }

    fn collect_with(&mut self, extra: Vec<ObjRef>) -> Collection {
        if !self.heap.gc_enabled() {
            return Collection::default();
        }
        let before = self.heap.bytes_allocated();
        let mut roots = self.roots();
        roots.extend(extra);

        let collection = self.heap.collect(roots);
        tracing::debug!(
            target: GC_TARGET,
            before,
            after = self.heap.bytes_allocated(),
            freed = collection.freed,
            interned_freed = collection.interned_freed,
            next_gc = self.heap.next_gc(),
            "collection finished"
        );
        collection
    }

    fn roots(&self) -> Vec<ObjRef> {
        let mut roots = Vec::with_capacity(self.stack.len() + self.frames.len() * 2 + 64);
        roots.extend(self.stack.iter().filter_map(Value::as_obj));
        for frame in &self.frames {
            roots.push(frame.closure);
            roots.push(frame.function);
            roots.extend(frame.generator);
        }
        roots.extend_from_slice(&self.open_upvalues);
        for (name, module) in self.modules.iter() {
            roots.push(name.handle);
            roots.extend(module.as_obj());
        }
        roots.push(self.core.module);
        roots.extend(self.core.classes.all());
        roots.extend(self.core.specials.iter().map(|key| key.handle));
        roots
    }

    pub fn gc_stats(&self) -> &GcStats {
        self.heap.stats()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.heap.bytes_allocated()
    }

    pub fn live_objects(&self) -> usize {
        self.heap.live_objects()
    }
}
