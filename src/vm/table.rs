//! Open-addressing hash table keyed by interned strings.
//!
//! Backs module globals, instance fields, class method tables and the
//! intern set itself. Keys carry their precomputed hash so probing never
//! touches the heap; two keys are equal iff their handles are equal, which
//! interning guarantees for equal content.

use super::value::{ObjRef, Value};

const MIN_CAPACITY: usize = 8;

/// An interned string handle paired with its hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrKey {
    pub handle: ObjRef,
    pub hash: u32,
}

impl StrKey {
    pub fn new(handle: ObjRef, hash: u32) -> Self {
        Self { handle, hash }
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Empty,
    Tombstone,
    Full(StrKey, Value),
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    slots: Vec<Slot>,
    count: usize,
    tombstones: usize,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Index of the slot holding `key`, or of the slot where it would be
    /// inserted (the first tombstone on the probe path, if any).
    fn find_slot(slots: &[Slot], key: StrKey) -> usize {
        let mask = slots.len() - 1;
        let mut index = key.hash as usize & mask;
        let mut tombstone = None;
        loop {
            match slots[index] {
                Slot::Empty => return tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Slot::Full(k, _) if k.handle == key.handle => return index,
                Slot::Full(..) => {}
            }
            index = (index + 1) & mask;
        }
    }

    pub fn get(&self, key: StrKey) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        match self.slots[Self::find_slot(&self.slots, key)] {
            Slot::Full(_, value) => Some(value),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: StrKey) -> bool {
        self.get(key).is_some()
    }

    /// Insert or overwrite. Returns true if the key was not present.
    pub fn put(&mut self, key: StrKey, value: Value) -> bool {
        if (self.count + self.tombstones + 1) * 4 > self.slots.len() * 3 {
            self.grow();
        }
        let index = Self::find_slot(&self.slots, key);
        let is_new = match self.slots[index] {
            Slot::Full(..) => false,
            Slot::Tombstone => {
                self.tombstones -= 1;
                true
            }
            Slot::Empty => true,
        };
        if is_new {
            self.count += 1;
        }
        self.slots[index] = Slot::Full(key, value);
        is_new
    }

    /// Remove `key`, leaving a tombstone so later probes keep walking.
    pub fn delete(&mut self, key: StrKey) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_slot(&self.slots, key);
        if let Slot::Full(..) = self.slots[index] {
            self.slots[index] = Slot::Tombstone;
            self.count -= 1;
            self.tombstones += 1;
            true
        } else {
            false
        }
    }

    /// Copy every entry of `other` into `self`; `other` wins on collisions.
    pub fn merge(&mut self, other: &Table) {
        for (key, value) in other.iter() {
            self.put(key, value);
        }
    }

    /// Look a key up by content. `bytes_of` resolves a stored handle to
    /// its bytes; it is only called for slots whose hash matches.
    pub fn find_string<'a>(
        &self,
        bytes: &[u8],
        hash: u32,
        bytes_of: impl Fn(ObjRef) -> &'a [u8],
    ) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let mask = self.slots.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            match self.slots[index] {
                Slot::Empty => return None,
                Slot::Full(k, _) if k.hash == hash && bytes_of(k.handle) == bytes => {
                    return Some(k.handle);
                }
                _ => {}
            }
            index = (index + 1) & mask;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (StrKey, Value)> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Full(k, v) => Some((*k, *v)),
            _ => None,
        })
    }

    /// Drop every entry whose key handle fails `is_live`. Used for the weak
    /// sweep of the intern set.
    pub fn remove_unmarked(&mut self, is_live: impl Fn(ObjRef) -> bool) -> usize {
        let mut removed = 0;
        for slot in self.slots.iter_mut() {
            if let Slot::Full(k, _) = slot {
                if !is_live(k.handle) {
                    *slot = Slot::Tombstone;
                    removed += 1;
                }
            }
        }
        self.count -= removed;
        self.tombstones += removed;
        removed
    }

    fn grow(&mut self) {
        let capacity = (self.slots.len() * 2).max(MIN_CAPACITY);
        let old = std::mem::replace(&mut self.slots, vec![Slot::Empty; capacity]);
        self.tombstones = 0;
        for slot in old {
            if let Slot::Full(key, value) = slot {
                let index = Self::find_slot(&self.slots, key);
                self.slots[index] = Slot::Full(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key(id: usize, hash: u32) -> StrKey {
        StrKey::new(ObjRef::new(id), hash)
    }

    #[test]
    fn test_put_get_overwrite() {
        let mut table = Table::new();
        assert!(table.put(key(1, 10), Value::Number(1.0)));
        assert!(!table.put(key(1, 10), Value::Number(2.0)));
        assert_eq!(table.get(key(1, 10)), Some(Value::Number(2.0)));
        assert_eq!(table.get(key(2, 10)), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_delete_keeps_collision_chain() {
        let mut table = Table::new();
        // Same hash: all three share one collision chain.
        table.put(key(1, 3), Value::Number(1.0));
        table.put(key(2, 3), Value::Number(2.0));
        table.put(key(3, 3), Value::Number(3.0));
        assert!(table.delete(key(2, 3)));
        assert!(!table.delete(key(2, 3)));
        assert_eq!(table.get(key(3, 3)), Some(Value::Number(3.0)));
        assert_eq!(table.len(), 2);

        // The tombstone is reused by the next insert on the chain.
        assert!(table.put(key(4, 3), Value::Null));
        assert_eq!(table.tombstones, 0);
    }

    #[test]
    fn test_grows_past_load_factor() {
        let mut table = Table::new();
        for i in 0..6 {
            table.put(key(i, i as u32), Value::Number(i as f64));
        }
        assert_eq!(table.capacity(), 8);
        table.put(key(6, 6), Value::Null);
        assert_eq!(table.capacity(), 16);
        for i in 0..6 {
            assert_eq!(table.get(key(i, i as u32)), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn test_merge_last_write_wins() {
        let mut a = Table::new();
        a.put(key(1, 1), Value::Number(1.0));
        a.put(key(2, 2), Value::Number(2.0));
        let mut b = Table::new();
        b.put(key(2, 2), Value::Number(20.0));
        b.put(key(3, 3), Value::Number(30.0));
        a.merge(&b);
        assert_eq!(a.len(), 3);
        assert_eq!(a.get(key(2, 2)), Some(Value::Number(20.0)));
    }

    #[test]
    fn test_find_string_by_content() {
        let names: [&[u8]; 3] = [b"alpha", b"beta", b"gamma"];
        let mut table = Table::new();
        for (i, _) in names.iter().enumerate() {
            table.put(key(i, 7), Value::Null);
        }
        let found = table.find_string(b"gamma", 7, |r| names[r.index()]);
        assert_eq!(found, Some(ObjRef::new(2)));
        assert_eq!(table.find_string(b"delta", 7, |r| names[r.index()]), None);
    }

    #[test]
    fn test_remove_unmarked() {
        let mut table = Table::new();
        for i in 0..4 {
            table.put(key(i, i as u32), Value::Null);
        }
        let removed = table.remove_unmarked(|r| r.index() % 2 == 0);
        assert_eq!(removed, 2);
        assert_eq!(table.len(), 2);
        assert!(table.contains_key(key(0, 0)));
        assert!(!table.contains_key(key(1, 1)));
    }
}
