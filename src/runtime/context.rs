//! Execution context: root set, exceptions and allocation entry points
//!
//! A context is the unit of mutation. It owns the heap, the local-variable
//! root stack, the ad-hoc tracked reference slices, the pending exception
//! slot and the per-type prototype registry. Every allocation site is a
//! potential collection point: a value produced by one allocator call may be
//! moved by the next, so any value held across an allocation must live in a
//! local, in a tracked slice, or inside an already-rooted object.

use super::error::{Error, ErrorKind, Result};
use super::gc;
use super::heap::{Heap, HeapConfig, HeapPtr};
use super::object;
use super::string;
use super::value::{BoxedFloat, BoxedInt, TypeTag, Value};

/// Handle to one rooted slot on the context's local stack.
#[derive(Clone, Copy, Debug)]
pub struct Local {
    pub(crate) idx: usize,
}

/// Marks a depth of the local stack; closing the scope evicts every local
/// pushed after the mark.
#[derive(Clone, Copy, Debug)]
pub struct LocalScope {
    mark: usize,
}

/// A registered slice of values owned by native code, walked and updated by
/// the collector like any other root.
pub(crate) struct TrackedSlice {
    pub ptr: *mut Value,
    pub len: usize,
}

/// Built-in prototype objects, one per value type that supports property
/// lookup through its type prototype.
#[derive(Default)]
pub(crate) struct Prototypes {
    pub object: Value,
    pub integer: Value,
    pub float: Value,
    pub string: Value,
    pub boolean: Value,
    pub void: Value,
    pub array: Value,
    pub buffer: Value,
    pub function: Value,
    pub class: Value,
    pub module: Value,
    pub iterator: Value,
}

impl Prototypes {
    pub(crate) fn slots_mut(&mut self) -> [&mut Value; 12] {
        [
            &mut self.object,
            &mut self.integer,
            &mut self.float,
            &mut self.string,
            &mut self.boolean,
            &mut self.void,
            &mut self.array,
            &mut self.buffer,
            &mut self.function,
            &mut self.class,
            &mut self.module,
            &mut self.iterator,
        ]
    }
}

/// The execution context.
pub struct Context {
    pub(crate) heap: Heap,
    pub(crate) locals: Vec<Value>,
    pub(crate) tracked: Vec<TrackedSlice>,
    pub(crate) exception: Value,
    pub(crate) prototypes: Prototypes,
    /// Preallocated "out of memory" exception string, raised without
    /// allocating.
    pub(crate) str_oom: Value,
    /// Shared empty argument array for internal calls.
    pub(crate) empty_array: Value,
}

impl Context {
    /// Create a context with the default heap configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(HeapConfig::default())
    }

    pub fn with_config(config: HeapConfig) -> Result<Self> {
        let mut ctx = Self {
            heap: Heap::new(config),
            locals: Vec::new(),
            tracked: Vec::new(),
            exception: Value::BADPTR,
            prototypes: Prototypes::default(),
            str_oom: Value::BADPTR,
            empty_array: Value::BADPTR,
        };

        ctx.str_oom = string::new_const_string(&mut ctx, "out of memory")?;
        ctx.empty_array = super::array::new_array(&mut ctx, 0)?;

        ctx.prototypes.object = object::new_object_with_prototype(&mut ctx, Value::VOID)?;
        let base = ctx.prototypes.object;
        for slot in [
            TypeTag::Integer,
            TypeTag::Float,
            TypeTag::String,
            TypeTag::Boolean,
            TypeTag::Void,
            TypeTag::Array,
            TypeTag::Buffer,
            TypeTag::Function,
            TypeTag::Class,
            TypeTag::Module,
            TypeTag::Iterator,
        ] {
            let proto = object::new_object_with_prototype(&mut ctx, base)?;
            match slot {
                TypeTag::Integer => ctx.prototypes.integer = proto,
                TypeTag::Float => ctx.prototypes.float = proto,
                TypeTag::String => ctx.prototypes.string = proto,
                TypeTag::Boolean => ctx.prototypes.boolean = proto,
                TypeTag::Void => ctx.prototypes.void = proto,
                TypeTag::Array => ctx.prototypes.array = proto,
                TypeTag::Buffer => ctx.prototypes.buffer = proto,
                TypeTag::Function => ctx.prototypes.function = proto,
                TypeTag::Class => ctx.prototypes.class = proto,
                TypeTag::Module => ctx.prototypes.module = proto,
                TypeTag::Iterator => ctx.prototypes.iterator = proto,
                _ => unreachable!(),
            }
        }

        Ok(ctx)
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a movable heap object, collecting once on exhaustion.
    pub(crate) fn alloc(&mut self, tag: TypeTag, size: usize) -> Result<HeapPtr> {
        if let Some(ptr) = self.heap.alloc_raw(tag, size) {
            return Ok(ptr);
        }

        // The collection itself can fail with OOM mid-evacuation; the heap
        // stays consistent either way, so retry the allocation regardless.
        let _ = gc::collect(self);

        match self.heap.alloc_raw(tag, size) {
            Some(ptr) => Ok(ptr),
            None => Err(self.raise_oom()),
        }
    }

    /// Allocate a pinned object that the collector will never move.
    pub(crate) fn alloc_pinned(&mut self, tag: TypeTag, size: usize) -> Result<HeapPtr> {
        match self.heap.alloc_off_heap(tag, size) {
            Some(ptr) => Ok(ptr),
            None => Err(self.raise_oom()),
        }
    }

    /// Box an integer: small values become immediate, wide ones go on the
    /// heap.
    pub fn new_int(&mut self, v: i64) -> Result<Value> {
        if Value::small_int_fits(v) {
            return Ok(Value::from_small_int(v));
        }
        let ptr = self.alloc(TypeTag::Integer, std::mem::size_of::<BoxedInt>())?;
        unsafe { ptr.as_mut::<BoxedInt>() }.value = v;
        Ok(Value::from_heap_ptr(ptr))
    }

    pub fn new_float(&mut self, v: f64) -> Result<Value> {
        let ptr = self.alloc(TypeTag::Float, std::mem::size_of::<BoxedFloat>())?;
        unsafe { ptr.as_mut::<BoxedFloat>() }.value = v;
        Ok(Value::from_heap_ptr(ptr))
    }

    // =========================================================================
    // Locals
    // =========================================================================

    /// Current depth of the local stack.
    pub fn scope(&self) -> LocalScope {
        LocalScope {
            mark: self.locals.len(),
        }
    }

    /// Root a value in a fresh local slot.
    pub fn push_local(&mut self, v: Value) -> Local {
        let idx = self.locals.len();
        self.locals.push(v);
        Local { idx }
    }

    /// Read a rooted slot. Always valid after allocations; the collector
    /// rewrites the stack in place.
    #[inline]
    pub fn local(&self, l: Local) -> Value {
        self.locals[l.idx]
    }

    #[inline]
    pub fn set_local(&mut self, l: Local, v: Value) {
        self.locals[l.idx] = v;
    }

    /// Evict every local pushed after the scope mark.
    pub fn close_scope(&mut self, s: LocalScope) {
        debug_assert!(s.mark <= self.locals.len());
        self.locals.truncate(s.mark);
    }

    /// Evict temporaries, preserving one slot's final value.
    pub fn close_scope_with(&mut self, s: LocalScope, keep: Local) -> Value {
        let v = self.local(keep);
        self.close_scope(s);
        v
    }

    /// Run `f` under a fresh local scope, evicting its locals on exit even
    /// when `f` fails.
    pub fn with_scope<T>(&mut self, f: impl FnOnce(&mut Context) -> Result<T>) -> Result<T> {
        let scope = self.scope();
        let result = f(self);
        self.close_scope(scope);
        result
    }

    /// Register a raw slice of values as collector roots.
    ///
    /// # Safety
    /// The slice must stay valid and fixed in memory until the matching
    /// [`Context::untrack_refs`] call, and must not alias the local stack.
    pub unsafe fn track_refs(&mut self, ptr: *mut Value, len: usize) {
        self.tracked.push(TrackedSlice { ptr, len });
    }

    /// Unregister the `n` most recently tracked slices.
    pub fn untrack_refs(&mut self, n: usize) {
        debug_assert!(n <= self.tracked.len());
        let new_len = self.tracked.len().saturating_sub(n);
        self.tracked.truncate(new_len);
    }

    // =========================================================================
    // Exceptions
    // =========================================================================

    pub fn is_exception_pending(&self) -> bool {
        !self.exception.is_bad()
    }

    /// The pending exception value, or the bad sentinel.
    pub fn get_exception(&self) -> Value {
        self.exception
    }

    pub fn clear_exception(&mut self) {
        self.exception = Value::BADPTR;
    }

    /// Raise an arbitrary value as an exception.
    pub fn raise_value(&mut self, v: Value) -> Error {
        self.exception = v;
        Error::new(ErrorKind::Exception)
    }

    /// Raise a string exception of the given kind.
    pub fn raise(&mut self, kind: ErrorKind, msg: &str) -> Error {
        match string::new_string(self, msg) {
            Ok(s) => self.exception = s,
            Err(_) => return Error::new(kind),
        }
        Error::new(kind)
    }

    /// Raise a string exception carrying the kind's default message.
    pub fn raise_kind(&mut self, kind: ErrorKind) -> Error {
        self.raise(kind, kind.as_str())
    }

    /// Raise a formatted string exception.
    pub fn raise_format(&mut self, kind: ErrorKind, args: std::fmt::Arguments<'_>) -> Error {
        let msg = std::fmt::format(args);
        self.raise(kind, &msg)
    }

    /// Raise the preallocated out-of-memory exception without allocating.
    pub fn raise_oom(&mut self) -> Error {
        self.exception = self.str_oom;
        Error::new(ErrorKind::OutOfMemory)
    }

    /// Raise an exception describing the current OS error.
    pub fn raise_errno(&mut self, prefix: &str) -> Error {
        self.raise_errno_value(prefix, last_errno())
    }

    /// Raise an exception describing the given OS error value.
    pub fn raise_errno_value(&mut self, prefix: &str, errnum: i32) -> Error {
        let os_err = std::io::Error::from_raw_os_error(errnum);
        let msg = if prefix.is_empty() {
            os_err.to_string()
        } else {
            format!("{}: {}", prefix, os_err)
        };
        self.raise(ErrorKind::Exception, &msg)
    }

    // =========================================================================
    // Garbage collection
    // =========================================================================

    /// Run a full collection cycle at this safe point.
    pub fn collect_garbage(&mut self) -> Result<gc::GcStats> {
        gc::collect(self)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Teardown finalizes every live object that declares a finalizer,
        // then the heap frees all pools.
        gc::finalize_all(self);
    }
}

/// Read the calling thread's errno.
fn last_errno() -> i32 {
    #[cfg(target_os = "linux")]
    unsafe {
        *libc::__errno_location()
    }
    #[cfg(target_os = "macos")]
    unsafe {
        *libc::__error()
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_int_boxing() {
        let mut ctx = Context::new().unwrap();

        let small = ctx.new_int(42).unwrap();
        assert!(small.is_small_int());
        assert_eq!(small.as_small_int(), 42);

        let wide = ctx.new_int(1i64 << 62).unwrap();
        assert!(wide.is_heap_object());
        assert_eq!(wide.type_tag(), TypeTag::Integer);
        let boxed = unsafe { &*wide.as_obj::<BoxedInt>() };
        assert_eq!(boxed.value, 1i64 << 62);
    }

    #[test]
    fn test_new_float() {
        let mut ctx = Context::new().unwrap();
        let v = ctx.new_float(2.5).unwrap();
        assert_eq!(v.type_tag(), TypeTag::Float);
        assert_eq!(unsafe { &*v.as_obj::<BoxedFloat>() }.value, 2.5);
    }

    #[test]
    fn test_local_scope_discipline() {
        let mut ctx = Context::new().unwrap();
        let scope = ctx.scope();

        let a = ctx.push_local(Value::from_small_int(1));
        let b = ctx.push_local(Value::from_small_int(2));
        assert_eq!(ctx.local(a).as_small_int(), 1);
        assert_eq!(ctx.local(b).as_small_int(), 2);

        ctx.set_local(a, Value::from_small_int(7));
        let kept = ctx.close_scope_with(scope, a);
        assert_eq!(kept.as_small_int(), 7);
        assert_eq!(ctx.scope().mark, scope.mark);
    }

    #[test]
    fn test_exception_slot() {
        let mut ctx = Context::new().unwrap();
        assert!(!ctx.is_exception_pending());

        let err = ctx.raise(ErrorKind::TypeMismatch, "object is not a number");
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        assert!(ctx.is_exception_pending());
        assert_eq!(ctx.get_exception().type_tag(), TypeTag::String);

        ctx.clear_exception();
        assert!(!ctx.is_exception_pending());
    }

    #[test]
    fn test_raise_errno_value() {
        let mut ctx = Context::new().unwrap();
        let err = ctx.raise_errno_value("open failed", libc::ENOENT);
        assert_eq!(err.kind(), ErrorKind::Exception);
        assert!(ctx.is_exception_pending());
    }

    #[test]
    fn test_raise_oom_needs_no_allocation() {
        let mut ctx = Context::new().unwrap();
        let err = ctx.raise_oom();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert_eq!(ctx.get_exception(), ctx.str_oom);
    }
}
