//! Per-class method tables: concurrently readable, serially mutated.
//!
//! A [`MethodTable`] maps name symbols to entry buckets. Mutations (store,
//! alias, remove, resize, duplicate) serialize on the table mutex; lookups
//! walk the bucket chains with no lock at all. The design that makes the
//! reader side safe:
//!
//! - The bin array is published through an atomic pointer with release
//!   ordering and fetched with acquire ordering. A resize builds the new
//!   array completely before the single publishing store.
//! - Fresh buckets are prepended, so a chain a reader captured only ever
//!   grows behind it. A resize never touches an old bucket or its `next`
//!   link: new chains are built from freshly allocated nodes that copy the
//!   old fields. A reader that captured the old array therefore keeps
//!   walking a frozen, complete chain until the swap, and a reader that
//!   captures the new array sees every binding rehashed into place.
//! - Every mutable bucket field is one atomic word (the method slot is an
//!   atomic pointer to an immutable allocation), so no field is ever torn.
//! - Nothing a reader can reach is freed before the table itself drops:
//!   retired bin arrays, unlinked buckets, and replaced method cells are
//!   parked in a ledger owned by the writer mutex.
//!
//! # Safety
//!
//! All raw-pointer dereferences in this module are justified by the ledger
//! discipline above: a pointer obtained from the live table is valid for at
//! least as long as the `&self` borrow that produced it, because
//! deallocation happens only in `Drop` (which requires `&mut self`).

use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::interop::ModuleHierarchy;
use crate::symbol::Symbol;
use crate::types::{Method, MethodId, ModuleId, ScopeId, TableError, TableStats, Visibility};

/// Smallest bin count a table is created with.
pub const MIN_BINS: usize = 16;

// ── Buckets ──────────────────────────────────────────────────────────────────

struct Bucket {
    name: Symbol,
    visibility: AtomicU8,
    method_id: AtomicU64,
    method: AtomicPtr<Method>,
    scope: AtomicU32,
    serial: AtomicU64,
    next: AtomicPtr<Bucket>,
}

/// An owned snapshot of one bucket's fields, as observed by a reader.
#[derive(Debug, Clone)]
pub struct MethodTableEntry {
    pub name: Symbol,
    pub visibility: Visibility,
    pub method: Method,
    pub method_id: MethodId,
    pub scope: ScopeId,
    pub serial: u64,
}

// ── Bin arrays and the ownership ledger ──────────────────────────────────────

struct Values {
    bins: usize,
    slots: Box<[AtomicPtr<Bucket>]>,
}

impl Values {
    fn with_bins(bins: usize) -> Values {
        let slots = (0..bins)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        Values { bins, slots }
    }
}

/// Everything the table has ever allocated. Grown under the writer mutex,
/// drained only on drop.
struct Ledger {
    arrays: Vec<Box<Values>>,
    buckets: Vec<*mut Bucket>,
    methods: Vec<*mut Method>,
}

// ── MethodTable ──────────────────────────────────────────────────────────────

/// A concurrent name → method binding table. See the module docs for the
/// synchronization contract.
pub struct MethodTable {
    values: AtomicPtr<Values>,
    entries: AtomicUsize,
    lock: Mutex<Ledger>,
}

// SAFETY: the raw pointers inside `Ledger` and `values` reference
// allocations exclusively owned by this table and freed only in `Drop`.
// Shared access is mediated by atomics (readers) and the mutex (writers).
unsafe impl Send for MethodTable {}
unsafe impl Sync for MethodTable {}

impl MethodTable {
    /// Create a table with `max(size, 16)` bins, rounded up to a power of
    /// two.
    pub fn new(size: usize) -> MethodTable {
        let bins = size.max(MIN_BINS).next_power_of_two();
        let array = Box::new(Values::with_bins(bins));
        let ptr = &*array as *const Values as *mut Values;
        MethodTable {
            values: AtomicPtr::new(ptr),
            entries: AtomicUsize::new(0),
            lock: Mutex::new(Ledger {
                arrays: vec![array],
                buckets: Vec::new(),
                methods: Vec::new(),
            }),
        }
    }

    fn bin_index(bins: usize, name: Symbol) -> usize {
        (name.hash_value() as usize) & (bins - 1)
    }

    /// The currently published bin array.
    fn current(&self) -> &Values {
        // SAFETY: `values` always points into an array parked in the ledger;
        // see the module Safety section.
        unsafe { &*self.values.load(Ordering::Acquire) }
    }

    fn alloc_method(ledger: &mut Ledger, method: Method) -> *mut Method {
        let ptr = Box::into_raw(Box::new(method));
        ledger.methods.push(ptr);
        ptr
    }

    /// Live bucket count.
    pub fn entries(&self) -> usize {
        self.entries.load(Ordering::Acquire)
    }

    /// Current bin count.
    pub fn bins(&self) -> usize {
        self.current().bins
    }

    // ── Mutation ─────────────────────────────────────────────────────────

    /// Bind `name` to a method.
    ///
    /// An existing bucket with the same name is overwritten in place,
    /// preserving its chain position; otherwise a fresh bucket is prepended
    /// to its bin. Crossing load factor 1.0 doubles the bin count.
    pub fn store(
        &self,
        name: Symbol,
        method_id: MethodId,
        method: Method,
        scope: ScopeId,
        serial: u64,
        visibility: Visibility,
    ) {
        let mut ledger = self.lock.lock().expect("method table mutex poisoned");
        let values = self.current();
        let idx = Self::bin_index(values.bins, name);

        let mut cur = values.slots[idx].load(Ordering::Relaxed);
        while !cur.is_null() {
            // SAFETY: chain pointers reference ledger-owned buckets.
            let bucket = unsafe { &*cur };
            if bucket.name == name {
                let method_ptr = Self::alloc_method(&mut ledger, method);
                bucket.method.store(method_ptr, Ordering::Release);
                bucket.method_id.store(method_id.0, Ordering::Release);
                bucket.scope.store(scope.0, Ordering::Release);
                bucket.serial.store(serial, Ordering::Release);
                bucket.visibility.store(visibility as u8, Ordering::Release);
                return;
            }
            cur = bucket.next.load(Ordering::Relaxed);
        }

        let method_ptr = Self::alloc_method(&mut ledger, method);
        let head = values.slots[idx].load(Ordering::Relaxed);
        let bucket = Box::into_raw(Box::new(Bucket {
            name,
            visibility: AtomicU8::new(visibility as u8),
            method_id: AtomicU64::new(method_id.0),
            method: AtomicPtr::new(method_ptr),
            scope: AtomicU32::new(scope.0),
            serial: AtomicU64::new(serial),
            next: AtomicPtr::new(head),
        }));
        ledger.buckets.push(bucket);
        values.slots[idx].store(bucket, Ordering::Release);

        let count = self.entries.fetch_add(1, Ordering::AcqRel) + 1;
        if count >= values.bins {
            let doubled = values.bins * 2;
            self.resize_locked(&mut ledger, doubled);
        }
    }

    /// Rehash every binding into a bin array of `new_bins` slots and publish
    /// it.
    ///
    /// The new chains are built from freshly allocated nodes that copy the
    /// old bucket fields (the method cell is shared, not reallocated). Old
    /// buckets and their `next` links are left untouched, so a reader
    /// mid-walk on the still-published old array sees its full chain; the
    /// retired nodes stay in the ledger until the table drops.
    fn resize_locked(&self, ledger: &mut Ledger, new_bins: usize) {
        let old = self.current();
        let array = Box::new(Values::with_bins(new_bins));

        for slot in old.slots.iter() {
            let mut chain: Vec<*mut Bucket> = Vec::new();
            let mut cur = slot.load(Ordering::Relaxed);
            while !cur.is_null() {
                chain.push(cur);
                // SAFETY: ledger-owned bucket.
                cur = unsafe { &*cur }.next.load(Ordering::Relaxed);
            }
            // Copy oldest-first and prepend, preserving chain order.
            for &ptr in chain.iter().rev() {
                // SAFETY: ledger-owned bucket; no writer runs concurrently
                // (the table mutex is held), so the field loads are settled.
                let bucket = unsafe { &*ptr };
                let idx = Self::bin_index(new_bins, bucket.name);
                let head = array.slots[idx].load(Ordering::Relaxed);
                let copy = Box::into_raw(Box::new(Bucket {
                    name: bucket.name,
                    visibility: AtomicU8::new(bucket.visibility.load(Ordering::Relaxed)),
                    method_id: AtomicU64::new(bucket.method_id.load(Ordering::Relaxed)),
                    method: AtomicPtr::new(bucket.method.load(Ordering::Relaxed)),
                    scope: AtomicU32::new(bucket.scope.load(Ordering::Relaxed)),
                    serial: AtomicU64::new(bucket.serial.load(Ordering::Relaxed)),
                    next: AtomicPtr::new(head),
                }));
                ledger.buckets.push(copy);
                array.slots[idx].store(copy, Ordering::Relaxed);
            }
        }

        let raw = &*array as *const Values as *mut Values;
        ledger.arrays.push(array);
        // Publication point: pairs with the acquire load in `find_entry`.
        self.values.store(raw, Ordering::Release);
    }

    /// Unbind `name`, returning the prior method slot.
    pub fn remove(&self, name: Symbol) -> Option<Method> {
        let _ledger = self.lock.lock().expect("method table mutex poisoned");
        let values = self.current();
        let idx = Self::bin_index(values.bins, name);

        let mut prev: Option<&Bucket> = None;
        let mut cur = values.slots[idx].load(Ordering::Relaxed);
        while !cur.is_null() {
            // SAFETY: ledger-owned bucket.
            let bucket = unsafe { &*cur };
            if bucket.name == name {
                let next = bucket.next.load(Ordering::Relaxed);
                match prev {
                    None => values.slots[idx].store(next, Ordering::Release),
                    Some(p) => p.next.store(next, Ordering::Release),
                }
                self.entries.fetch_sub(1, Ordering::AcqRel);
                // SAFETY: method cells live in the ledger until drop.
                let method = unsafe { &*bucket.method.load(Ordering::Acquire) }.clone();
                return Some(method);
            }
            prev = Some(bucket);
            cur = bucket.next.load(Ordering::Relaxed);
        }
        None
    }

    /// Install `new_name` as an alias of `orig_name`, resolving through
    /// `orig_module` and its ancestors until an installable method is found.
    ///
    /// When the walk fails, a caller-supplied `(method_id, method)` pair is
    /// accepted as a last resort if it is itself installable.
    pub fn alias(
        &self,
        new_name: Symbol,
        visibility: Visibility,
        orig_name: Symbol,
        orig_method: Option<(MethodId, Method)>,
        orig_module: ModuleId,
        modules: &dyn ModuleHierarchy,
    ) -> Result<(), TableError> {
        let mut module = Some(orig_module);
        while let Some(current) = module {
            if let Some(table) = modules.method_table(current) {
                if let Some(entry) = table.find_entry(orig_name) {
                    if entry.method.is_installable() {
                        self.store(
                            new_name,
                            entry.method_id,
                            entry.method,
                            entry.scope,
                            entry.serial,
                            visibility,
                        );
                        return Ok(());
                    }
                }
            }
            module = modules.superclass(current);
        }

        match orig_method {
            Some((id, method)) if method.is_installable() => {
                self.store(new_name, id, method, ScopeId(0), 0, visibility);
                Ok(())
            }
            _ => Err(TableError::NoMethodToAlias {
                name: orig_name.as_str().to_string(),
            }),
        }
    }

    /// Deep-copy into an independent table of the same bin count.
    pub fn duplicate(&self) -> MethodTable {
        let _guard = self.lock.lock().expect("method table mutex poisoned");
        let values = self.current();
        let copy = MethodTable::new(values.bins);
        for slot in values.slots.iter() {
            let mut chain: Vec<&Bucket> = Vec::new();
            let mut cur = slot.load(Ordering::Relaxed);
            while !cur.is_null() {
                // SAFETY: ledger-owned bucket.
                chain.push(unsafe { &*cur });
                cur = unsafe { &*cur }.next.load(Ordering::Relaxed);
            }
            // Insert back-to-front so prepending reproduces chain order.
            for bucket in chain.into_iter().rev() {
                let entry = Self::snapshot(bucket);
                copy.store(
                    entry.name,
                    entry.method_id,
                    entry.method,
                    entry.scope,
                    entry.serial,
                    entry.visibility,
                );
            }
        }
        copy
    }

    // ── Lock-free reads ──────────────────────────────────────────────────

    /// Look up `name`. Safe to call from any thread; never blocks.
    pub fn lookup(&self, name: Symbol) -> Option<MethodTableEntry> {
        self.find_entry(name)
    }

    /// The lookup walk itself, exposed for internal code paths that bypass
    /// promotion. Same observability contract as [`lookup`].
    ///
    /// [`lookup`]: MethodTable::lookup
    pub fn find_entry(&self, name: Symbol) -> Option<MethodTableEntry> {
        let values = self.current();
        let idx = Self::bin_index(values.bins, name);
        let mut cur = values.slots[idx].load(Ordering::Acquire);
        while !cur.is_null() {
            // SAFETY: chain pointers reference ledger-owned buckets that
            // outlive this `&self` borrow.
            let bucket = unsafe { &*cur };
            if bucket.name == name {
                return Some(Self::snapshot(bucket));
            }
            cur = bucket.next.load(Ordering::Acquire);
        }
        None
    }

    fn snapshot(bucket: &Bucket) -> MethodTableEntry {
        // SAFETY: method cells are ledger-owned until the table drops.
        let method = unsafe { &*bucket.method.load(Ordering::Acquire) }.clone();
        MethodTableEntry {
            name: bucket.name,
            visibility: Visibility::from_u8(bucket.visibility.load(Ordering::Acquire)),
            method,
            method_id: MethodId(bucket.method_id.load(Ordering::Acquire)),
            scope: ScopeId(bucket.scope.load(Ordering::Acquire)),
            serial: bucket.serial.load(Ordering::Acquire),
        }
    }

    /// True if `name` currently has a bucket.
    pub fn has_name(&self, name: Symbol) -> bool {
        self.find_entry(name).is_some()
    }

    /// Visit every entry (snapshot per bucket). Chain order within a bin is
    /// newest-first; bins are visited in index order.
    pub fn for_each(&self, mut f: impl FnMut(&MethodTableEntry)) {
        let values = self.current();
        for slot in values.slots.iter() {
            let mut cur = slot.load(Ordering::Acquire);
            while !cur.is_null() {
                // SAFETY: ledger-owned bucket.
                let bucket = unsafe { &*cur };
                f(&Self::snapshot(bucket));
                cur = bucket.next.load(Ordering::Acquire);
            }
        }
    }

    /// Shape summary for diagnostics.
    pub fn stats(&self) -> TableStats {
        let values = self.current();
        let mut occupied = 0usize;
        let mut longest = 0usize;
        for slot in values.slots.iter() {
            let mut len = 0usize;
            let mut cur = slot.load(Ordering::Acquire);
            while !cur.is_null() {
                len += 1;
                // SAFETY: ledger-owned bucket.
                cur = unsafe { &*cur }.next.load(Ordering::Acquire);
            }
            if len > 0 {
                occupied += 1;
            }
            longest = longest.max(len);
        }
        TableStats {
            bins: values.bins,
            entries: self.entries(),
            occupied_bins: occupied,
            longest_chain: longest,
        }
    }
}

impl Drop for MethodTable {
    fn drop(&mut self) {
        let ledger = self
            .lock
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for &bucket in &ledger.buckets {
            // SAFETY: ledger pointers are uniquely owned; `&mut self` proves
            // no reader borrow is outstanding.
            unsafe { drop(Box::from_raw(bucket)) };
        }
        for &method in &ledger.methods {
            // SAFETY: as above.
            unsafe { drop(Box::from_raw(method)) };
        }
        ledger.buckets.clear();
        ledger.methods.clear();
        // Bin arrays drop with the ledger's `arrays` vector.
    }
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodTable")
            .field("bins", &self.bins())
            .field("entries", &self.entries())
            .finish()
    }
}

// ── Unit tests ───────────────────────────────────────────────────────────────
