//! The mark-sweep garbage collector and pluggable allocator that emitted
//! programs link against (spec.md §3.7, §4.10).
//!
//! This module is a host-side model of the runtime library the code
//! generator calls into (`gc_alloc`, `gc_collect`, ...): the emitted x86-64
//! calls these symbols by name, and this is their Rust implementation,
//! grounded on the singleton-registry pattern (`types::registry`'s
//! `thread_local!`-backed interner) for the process-wide `AllocatorManager`
//! and heap state.

use std::cell::RefCell;
use std::collections::HashSet;

/// Object type tags stored in every allocation's header (spec.md §3.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag { Raw, String, List, Record, Closure, Array, Box }

bitflags::bitflags! {
  /// Per-object flags; `Finalize` is reserved for a future destructor hook.
  #[derive(Clone, Copy, PartialEq, Eq)]
  pub struct ObjectFlags: u8 {
    const PINNED = 0b001;
    const WEAK = 0b010;
    const FINALIZE = 0b100;
  }
}

/// A single managed allocation. Real emitted code addresses the `data`
/// bytes directly; this model keeps the header fields alongside for the
/// mark/sweep pass instead of prefixing a flat byte buffer, since there is
/// no machine memory to lay them out in here.
#[derive(Debug)]
struct Header {
  tag: TypeTag,
  marked: bool,
  flags: ObjectFlags,
  /// Pointers this object holds to other GC objects, by handle.
  refs: Vec<GcHandle>,
  data: Vec<u8>,
}

/// An opaque handle into the GC heap; stands in for what would be a raw
/// pointer in the emitted binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcHandle(u32);

#[derive(Debug, Default, Clone, Copy)]
pub struct AllocatorStats {
  pub total_allocated: usize,
  pub total_allocations: u64,
  pub total_frees: u64,
  pub peak_usage: usize,
  pub current_objects: usize,
}

/// Which backing allocator is currently active. `System` wraps the host
/// allocator; `Arena` bumps a buffer and only frees on `reset`; `Pool`
/// recycles fixed-size blocks via a free list (spec.md §4.10).
enum Allocator {
  System,
  Arena { buf: Vec<u8>, offset: usize },
  Pool { block_size: usize, free_list: Vec<usize> },
}

const DEFAULT_THRESHOLD: usize = 1024 * 1024;

struct Heap {
  objects: Vec<Option<Header>>,
  roots: HashSet<GcHandle>,
  frames: Vec<Vec<GcHandle>>,
  threshold: usize,
  allocator: Allocator,
  stats: AllocatorStats,
  enabled: bool,
  /// Whether emitted `print`/`println` calls should be modeled as buffering
  /// output instead of writing it immediately; set from `CompileOptions`.
  stdout_caching: bool,
}

impl Heap {
  fn new() -> Self {
    Self {
      objects: Vec::new(), roots: HashSet::new(), frames: vec![Vec::new()],
      threshold: DEFAULT_THRESHOLD, allocator: Allocator::System,
      stats: AllocatorStats::default(), enabled: true, stdout_caching: true,
    }
  }
}

thread_local! {
  static HEAP: RefCell<Heap> = RefCell::new(Heap::new());
}

/// Allocates a raw object of `size` bytes tagged `tag`, collecting first if
/// the allocator reports we're over threshold. Mirrors `gc_alloc`.
pub fn gc_alloc(size: usize, tag: TypeTag) -> GcHandle {
  HEAP.with(|h| {
    let mut heap = h.borrow_mut();
    if heap.enabled && heap.stats.total_allocated > heap.threshold {
      drop(heap);
      gc_collect();
      heap = h.borrow_mut();
    }
    let data = vec![0u8; size];
    let header = Header { tag, marked: false, flags: ObjectFlags::empty(), refs: Vec::new(), data };
    let handle = GcHandle(heap.objects.len() as u32);
    heap.objects.push(Some(header));
    heap.stats.total_allocated += size;
    heap.stats.total_allocations += 1;
    heap.stats.current_objects += 1;
    heap.stats.peak_usage = heap.stats.peak_usage.max(heap.stats.total_allocated);
    handle
  })
}

pub fn gc_alloc_string(bytes: &[u8]) -> GcHandle {
  let h = gc_alloc(bytes.len(), TypeTag::String);
  HEAP.with(|heap| {
    if let Some(Some(obj)) = heap.borrow_mut().objects.get_mut(h.0 as usize) {
      obj.data.copy_from_slice(bytes);
    }
  });
  h
}

pub fn gc_alloc_list(elements: &[GcHandle]) -> GcHandle {
  let h = gc_alloc(elements.len() * 8, TypeTag::List);
  HEAP.with(|heap| {
    if let Some(Some(obj)) = heap.borrow_mut().objects.get_mut(h.0 as usize) {
      obj.refs.extend_from_slice(elements);
    }
  });
  h
}

pub fn gc_alloc_record(field_count: usize, field_refs: &[GcHandle]) -> GcHandle {
  let h = gc_alloc(field_count * 8, TypeTag::Record);
  HEAP.with(|heap| {
    if let Some(Some(obj)) = heap.borrow_mut().objects.get_mut(h.0 as usize) {
      obj.refs.extend_from_slice(field_refs);
    }
  });
  h
}

pub fn gc_alloc_closure(captures: &[GcHandle]) -> GcHandle {
  let h = gc_alloc(captures.len() * 8, TypeTag::Closure);
  HEAP.with(|heap| {
    if let Some(Some(obj)) = heap.borrow_mut().objects.get_mut(h.0 as usize) {
      obj.refs.extend_from_slice(captures);
    }
  });
  h
}

/// Pushes a new stack frame onto the root-tracking list; every handle a
/// generated function binds to a local goes through `gc_push_frame`'s
/// associated frame so sweep doesn't collect live locals.
pub fn gc_push_frame() {
  HEAP.with(|h| h.borrow_mut().frames.push(Vec::new()));
}

pub fn gc_pop_frame() {
  HEAP.with(|h| { h.borrow_mut().frames.pop(); });
}

pub fn gc_frame_push_local(handle: GcHandle) {
  HEAP.with(|h| {
    let mut heap = h.borrow_mut();
    if let Some(frame) = heap.frames.last_mut() { frame.push(handle); }
  });
}

pub fn gc_pin(handle: GcHandle) {
  set_flag(handle, ObjectFlags::PINNED, true);
}

pub fn gc_unpin(handle: GcHandle) {
  set_flag(handle, ObjectFlags::PINNED, false);
}

fn set_flag(handle: GcHandle, flag: ObjectFlags, on: bool) {
  HEAP.with(|h| {
    if let Some(Some(obj)) = h.borrow_mut().objects.get_mut(handle.0 as usize) {
      if on { obj.flags |= flag; } else { obj.flags &= !flag; }
    }
  });
}

pub fn gc_add_root(handle: GcHandle) {
  HEAP.with(|h| { h.borrow_mut().roots.insert(handle); });
}

pub fn gc_remove_root(handle: GcHandle) {
  HEAP.with(|h| { h.borrow_mut().roots.remove(&handle); });
}

pub fn gc_enable() { HEAP.with(|h| h.borrow_mut().enabled = true); }
pub fn gc_disable() { HEAP.with(|h| h.borrow_mut().enabled = false); }

pub fn gc_init() { HEAP.with(|h| *h.borrow_mut() = Heap::new()); }

pub fn gc_shutdown() {
  HEAP.with(|h| {
    let mut heap = h.borrow_mut();
    heap.objects.clear();
    heap.stats.current_objects = 0;
  });
}

pub fn gc_stats() -> AllocatorStats {
  HEAP.with(|h| h.borrow().stats)
}

/// Mark phase: clear marks, seed the worklist from explicit roots and every
/// handle pushed into a live frame, then trace outward by type tag
/// (spec.md §4.10). Sweep phase: free every unmarked, unpinned object and
/// update the stats.
pub fn gc_collect() {
  HEAP.with(|h| {
    let mut heap = h.borrow_mut();
    for obj in heap.objects.iter_mut().flatten() { obj.marked = false; }

    let mut worklist: Vec<GcHandle> = heap.roots.iter().copied().collect();
    for frame in &heap.frames { worklist.extend(frame.iter().copied()); }

    while let Some(handle) = worklist.pop() {
      let Some(Some(obj)) = heap.objects.get_mut(handle.0 as usize) else { continue };
      if obj.marked { continue }
      obj.marked = true;
      worklist.extend(obj.refs.iter().copied());
    }

    let mut freed_bytes = 0usize;
    let mut freed_count = 0u64;
    for slot in &mut heap.objects {
      let keep = match slot {
        Some(obj) => obj.marked || obj.flags.contains(ObjectFlags::PINNED),
        None => true,
      };
      if !keep {
        if let Some(obj) = slot.take() {
          freed_bytes += obj.data.len();
          freed_count += 1;
        }
      }
    }
    heap.stats.total_allocated = heap.stats.total_allocated.saturating_sub(freed_bytes);
    heap.stats.total_frees += freed_count;
    heap.stats.current_objects = heap.stats.current_objects.saturating_sub(freed_count as usize);
  });
}

/// Installs an arena allocator of `capacity` bytes as the active backend.
/// Real emitted code never observes which allocator is active beyond the
/// pointers it receives — this only changes how `gc_alloc`'s bookkeeping
/// models reuse and reset.
pub fn gc_set_allocator_arena(capacity: usize) {
  HEAP.with(|h| h.borrow_mut().allocator = Allocator::Arena { buf: vec![0; capacity], offset: 0 });
}

pub fn gc_set_allocator_pool(block_size: usize) {
  HEAP.with(|h| h.borrow_mut().allocator = Allocator::Pool { block_size, free_list: Vec::new() });
}

pub fn gc_reset_allocator() {
  HEAP.with(|h| h.borrow_mut().allocator = Allocator::System);
}

pub fn gc_set_threshold(bytes: usize) {
  HEAP.with(|h| h.borrow_mut().threshold = bytes);
}

pub fn gc_set_stdout_caching(on: bool) {
  HEAP.with(|h| h.borrow_mut().stdout_caching = on);
}

pub fn gc_stdout_caching() -> bool {
  HEAP.with(|h| h.borrow().stdout_caching)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn reset() { gc_init(); }

  #[test]
  fn unrooted_object_is_collected() {
    reset();
    let h = gc_alloc(16, TypeTag::Raw);
    gc_collect();
    let stats = gc_stats();
    assert_eq!(stats.current_objects, 0);
    let _ = h;
  }

  #[test]
  fn rooted_object_survives_collection() {
    reset();
    let h = gc_alloc(16, TypeTag::Raw);
    gc_add_root(h);
    gc_collect();
    assert_eq!(gc_stats().current_objects, 1);
    gc_remove_root(h);
    gc_collect();
    assert_eq!(gc_stats().current_objects, 0);
  }

  #[test]
  fn pinned_object_survives_even_when_unrooted() {
    reset();
    let h = gc_alloc(8, TypeTag::Raw);
    gc_pin(h);
    gc_collect();
    assert_eq!(gc_stats().current_objects, 1);
  }

  #[test]
  fn list_element_reachable_through_root_survives() {
    reset();
    let elem = gc_alloc(8, TypeTag::Raw);
    let list = gc_alloc_list(&[elem]);
    gc_add_root(list);
    gc_collect();
    assert_eq!(gc_stats().current_objects, 2);
  }

  #[test]
  fn stdout_caching_defaults_on_and_is_configurable() {
    reset();
    assert!(gc_stdout_caching());
    gc_set_stdout_caching(false);
    assert!(!gc_stdout_caching());
  }

  #[test]
  fn frame_locals_are_treated_as_roots() {
    reset();
    gc_push_frame();
    let h = gc_alloc(8, TypeTag::Raw);
    gc_frame_push_local(h);
    gc_collect();
    assert_eq!(gc_stats().current_objects, 1);
    gc_pop_frame();
    gc_collect();
    assert_eq!(gc_stats().current_objects, 0);
  }
}
