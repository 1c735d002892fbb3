//! ID-keyed index used for the player and conversation tables.
//!
//! A small separate-chaining hash table. The keys are already uniformly
//! random 64-bit IDs, so the bucket is just the ID modulo the table size
//! and no further mixing is needed. The table starts at 8 buckets and
//! doubles whenever it would go above 3/4 full.

use crate::id::Id;

const INITIAL_SIZE: usize = 8;

struct Entry<V> {
    id: u64,
    value: V,
    next: Option<Box<Entry<V>>>,
}

pub struct IdMap<V> {
    buckets: Vec<Option<Box<Entry<V>>>>,
    len: usize,
}

impl<V> IdMap<V> {
    pub fn new() -> IdMap<V> {
        IdMap {
            buckets: (0..INITIAL_SIZE).map(|_| None).collect(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn bucket(&self, id: u64) -> usize {
        (id % self.buckets.len() as u64) as usize
    }

    /// Inserts `value` under `id`, returning the previous value if the ID
    /// was already present.
    pub fn insert(&mut self, id: Id, value: V) -> Option<V> {
        let raw = id.as_raw();
        let pos = self.bucket(raw);

        let mut entry = self.buckets[pos].as_deref_mut();
        while let Some(e) = entry {
            if e.id == raw {
                return Some(std::mem::replace(&mut e.value, value));
            }
            entry = e.next.as_deref_mut();
        }

        if self.len + 1 > self.buckets.len() * 3 / 4 {
            self.grow();
        }

        let pos = self.bucket(raw);
        let head = self.buckets[pos].take();
        self.buckets[pos] = Some(Box::new(Entry {
            id: raw,
            value,
            next: head,
        }));
        self.len += 1;

        None
    }

    fn grow(&mut self) {
        // Gather every entry into one chain, then redistribute over the
        // doubled table.
        let mut all = None;
        for bucket in &mut self.buckets {
            let mut chain = bucket.take();
            while let Some(mut entry) = chain {
                chain = entry.next.take();
                entry.next = all;
                all = Some(entry);
            }
        }

        let new_size = self.buckets.len() * 2;
        self.buckets = (0..new_size).map(|_| None).collect();

        while let Some(mut entry) = all {
            all = entry.next.take();
            let pos = self.bucket(entry.id);
            entry.next = self.buckets[pos].take();
            self.buckets[pos] = Some(entry);
        }
    }

    pub fn get(&self, id: Id) -> Option<&V> {
        let raw = id.as_raw();
        let mut entry = self.buckets[self.bucket(raw)].as_deref();
        while let Some(e) = entry {
            if e.id == raw {
                return Some(&e.value);
            }
            entry = e.next.as_deref();
        }
        None
    }

    pub fn get_mut(&mut self, id: Id) -> Option<&mut V> {
        let raw = id.as_raw();
        let pos = self.bucket(raw);
        let mut entry = self.buckets[pos].as_deref_mut();
        while let Some(e) = entry {
            if e.id == raw {
                return Some(&mut e.value);
            }
            entry = e.next.as_deref_mut();
        }
        None
    }

    /// Removes and returns the entry for `id`, walking its chain and
    /// unlinking it.
    pub fn remove(&mut self, id: Id) -> Option<V> {
        let raw = id.as_raw();
        let pos = self.bucket(raw);
        let head = &mut self.buckets[pos];

        if head.as_ref().map_or(false, |e| e.id == raw) {
            let mut removed = head.take().unwrap();
            *head = removed.next.take();
            self.len -= 1;
            return Some(removed.value);
        }

        let mut prev = head.as_deref_mut();
        while let Some(entry) = prev {
            if entry.next.as_ref().map_or(false, |e| e.id == raw) {
                let mut removed = entry.next.take().unwrap();
                entry.next = removed.next.take();
                self.len -= 1;
                return Some(removed.value);
            }
            prev = entry.next.as_deref_mut();
        }

        None
    }

    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            buckets: &self.buckets,
            next_bucket: 0,
            entry: None,
        }
    }
}

impl<V> Default for IdMap<V> {
    fn default() -> Self {
        IdMap::new()
    }
}

pub struct Iter<'a, V> {
    buckets: &'a [Option<Box<Entry<V>>>],
    next_bucket: usize,
    entry: Option<&'a Entry<V>>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (Id, &'a V);

    fn next(&mut self) -> Option<(Id, &'a V)> {
        loop {
            if let Some(entry) = self.entry {
                self.entry = entry.next.as_deref();
                // Zero never enters the table; `insert` takes an `Id`.
                let id = Id::from_raw(entry.id).unwrap();
                return Some((id, &entry.value));
            }

            if self.next_bucket == self.buckets.len() {
                return None;
            }

            self.entry = self.buckets[self.next_bucket].as_deref();
            self.next_bucket += 1;
        }
    }
}
