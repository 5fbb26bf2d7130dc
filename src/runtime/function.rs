//! Functions, classes, modules and interpreter stacks
//!
//! A function is a callable descriptor: native handler or bytecode linkage,
//! argument metadata, and a small state machine for generator semantics. The
//! original function object of a generator acts as a template (`GenInit`);
//! calling it produces a primed per-call copy (`GenReady`) that owns its own
//! register frame. A class is a function with a prototype and a property
//! table; its prototype is published as a dynamic property.
//!
//! Modules are pinned off-heap because the interpreter holds native pointers
//! into their bytecode; their other fields are ordinary heap values.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::array;
use super::context::Context;
use super::error::{ErrorKind, Result};
use super::heap::ObjectHeader;
use super::object;
use super::value::{TypeTag, Value};

/// Native function entry point. `args` is an array value.
pub type NativeHandler = fn(&mut Context, Value, Value) -> Result<Value>;

/// Generator state machine.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum FunctionState {
    /// Normal function; every call is fresh.
    Regular = 0,
    /// Uninvoked generator template.
    GenInit = 1,
    /// Primed generator that has not started executing.
    GenReady = 2,
    /// Suspended generator.
    GenActive = 3,
    /// Currently executing (re-entry guard).
    GenRunning = 4,
    /// Exhausted.
    GenDone = 5,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FunctionFlags: u8 {
        /// Captures closures from an enclosing scope.
        const CLOSURE = 1;
        /// Accepts trailing rest arguments.
        const ELLIPSIS = 2;
    }
}

/// Heap layout of a function.
#[repr(C)]
pub struct FunctionObj {
    pub header: ObjectHeader,
    /// Value bits of the name string.
    pub name: AtomicUsize,
    /// Value bits of the owning module, bad for detached functions.
    pub module: AtomicUsize,
    /// Value bits of the captured-closures array, bad when none.
    pub closures: AtomicUsize,
    /// Value bits of the default-arguments array, bad when none.
    pub defaults: AtomicUsize,
    /// Value bits of the register frame of a primed generator.
    pub generator_frame: AtomicUsize,
    pub handler: Option<NativeHandler>,
    pub state: AtomicU32,
    /// Bytecode offset of the entry point.
    pub instr_offs: u32,
    /// Source line of the definition, printed in stringification.
    pub def_line: u32,
    pub flags: u8,
    pub num_args: u8,
    pub num_regs: u8,
    pub args_reg: u8,
}

/// Heap layout of a class: a function plus prototype and properties.
#[repr(C)]
pub struct ClassObj {
    pub fun: FunctionObj,
    pub prototype: AtomicUsize,
    pub props: AtomicUsize,
}

/// Both functions and classes start with the function descriptor.
///
/// # Safety
/// `v` must be a live `Function` or `Class` value.
pub(crate) unsafe fn fun_parts(v: Value) -> &'static FunctionObj {
    debug_assert!(matches!(v.type_tag(), TypeTag::Function | TypeTag::Class));
    unsafe { &*v.as_obj::<FunctionObj>() }
}

// =========================================================================
// Construction
// =========================================================================

fn init_function(
    f: &mut FunctionObj,
    name: Value,
    handler: Option<NativeHandler>,
    num_args: u8,
    state: FunctionState,
) {
    f.name = AtomicUsize::new(name.to_bits());
    f.module = AtomicUsize::new(Value::BADPTR.to_bits());
    f.closures = AtomicUsize::new(Value::BADPTR.to_bits());
    f.defaults = AtomicUsize::new(Value::BADPTR.to_bits());
    f.generator_frame = AtomicUsize::new(Value::BADPTR.to_bits());
    f.handler = handler;
    f.state = AtomicU32::new(u32::from(state));
    f.instr_offs = 0;
    f.def_line = 0;
    f.flags = FunctionFlags::empty().bits();
    f.num_args = num_args;
    f.num_regs = 0;
    f.args_reg = 0;
}

/// Create a plain function.
pub fn new_function(ctx: &mut Context, name: Value) -> Result<Value> {
    ctx.with_scope(|ctx| {
        let name_loc = ctx.push_local(name);
        let ptr = ctx.alloc(TypeTag::Function, std::mem::size_of::<FunctionObj>())?;
        let name = ctx.local(name_loc);
        init_function(
            unsafe { ptr.as_mut::<FunctionObj>() },
            name,
            None,
            0,
            FunctionState::Regular,
        );
        Ok(Value::from_heap_ptr(ptr))
    })
}

/// Create a function backed by a native handler.
pub fn new_native_function(
    ctx: &mut Context,
    name: Value,
    handler: NativeHandler,
    num_args: u8,
) -> Result<Value> {
    ctx.with_scope(|ctx| {
        let name_loc = ctx.push_local(name);
        let ptr = ctx.alloc(TypeTag::Function, std::mem::size_of::<FunctionObj>())?;
        let name = ctx.local(name_loc);
        init_function(
            unsafe { ptr.as_mut::<FunctionObj>() },
            name,
            Some(handler),
            num_args,
            FunctionState::Regular,
        );
        Ok(Value::from_heap_ptr(ptr))
    })
}

/// Create a generator template backed by a native handler. `num_regs`
/// registers are available to each primed instance as cursor state.
pub fn new_native_generator(
    ctx: &mut Context,
    name: Value,
    handler: NativeHandler,
    num_regs: u8,
) -> Result<Value> {
    let v = new_native_function(ctx, name, handler, 0)?;
    let f = unsafe { &mut *v.as_obj::<FunctionObj>() };
    f.num_regs = num_regs;
    f.state
        .store(u32::from(FunctionState::GenInit), Ordering::Release);
    Ok(v)
}

fn class_prototype_getter(ctx: &mut Context, this: Value, _args: Value) -> Result<Value> {
    if !this.is_heap_object() || this.type_tag() != TypeTag::Class {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "object is not a class"));
    }
    let class = unsafe { &*this.as_obj::<ClassObj>() };
    Ok(Value::from_bits(class.prototype.load(Ordering::Acquire)))
}

fn class_prototype_setter(ctx: &mut Context, this: Value, args: Value) -> Result<Value> {
    if !this.is_heap_object() || this.type_tag() != TypeTag::Class {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "object is not a class"));
    }
    let value = array::array_read(ctx, args, 0)?;
    let class = unsafe { &*this.as_obj::<ClassObj>() };
    class.prototype.store(value.to_bits(), Ordering::Release);
    Ok(Value::VOID)
}

/// Create a class with the given instance prototype. The prototype is
/// exposed as a dynamic `"prototype"` property with accessor semantics.
pub fn new_class(ctx: &mut Context, prototype: Value) -> Result<Value> {
    ctx.with_scope(|ctx| {
        let proto_loc = ctx.push_local(prototype);
        let name = super::string::new_string(ctx, "")?;
        let name_loc = ctx.push_local(name);

        let ptr = ctx.alloc(TypeTag::Class, std::mem::size_of::<ClassObj>())?;
        let name = ctx.local(name_loc);
        let prototype = ctx.local(proto_loc);

        let class = unsafe { ptr.as_mut::<ClassObj>() };
        init_function(&mut class.fun, name, None, 0, FunctionState::Regular);
        class.prototype = AtomicUsize::new(prototype.to_bits());
        class.props = AtomicUsize::new(Value::BADPTR.to_bits());

        let class_val = Value::from_heap_ptr(ptr);
        let class_loc = ctx.push_local(class_val);
        let prop_name = super::string::new_string(ctx, "prototype")?;
        let class_val = ctx.local(class_loc);
        object::set_builtin_dynamic_property(
            ctx,
            class_val,
            prop_name,
            Some(class_prototype_getter),
            Some(class_prototype_setter),
        )?;
        Ok(ctx.local(class_loc))
    })
}

// =========================================================================
// Inspection
// =========================================================================

/// Current generator state.
pub fn function_state(v: Value) -> FunctionState {
    let raw = unsafe { fun_parts(v) }.state.load(Ordering::Acquire);
    FunctionState::try_from(raw).expect("corrupt function state")
}

/// True for primed, suspended and exhausted generators.
pub fn is_generator(v: Value) -> bool {
    matches!(
        function_state(v),
        FunctionState::GenReady | FunctionState::GenActive | FunctionState::GenDone
    )
}

pub fn function_name(v: Value) -> Value {
    Value::from_bits(unsafe { fun_parts(v) }.name.load(Ordering::Acquire))
}

// =========================================================================
// Calling
// =========================================================================

/// Prime a generator template: copy the function header, sharing module,
/// closures and defaults, with a fresh register frame.
fn prime_generator(ctx: &mut Context, template: Value) -> Result<Value> {
    ctx.with_scope(|ctx| {
        let tmpl_loc = ctx.push_local(template);

        let num_regs = unsafe { fun_parts(template) }.num_regs;
        let frame = new_stack(ctx, u32::from(num_regs))?;
        let frame_loc = ctx.push_local(frame);
        {
            // The frame doubles as the generator's registers; expose them all.
            let frame = ctx.local(frame_loc);
            let stack = unsafe { &*frame.as_obj::<StackObj>() };
            for i in 0..u32::from(num_regs) {
                unsafe { stack.slot(i) }.store(Value::VOID.to_bits(), Ordering::Release);
            }
            stack.size.store(u32::from(num_regs), Ordering::Release);
        }

        let ptr = ctx.alloc(TypeTag::Function, std::mem::size_of::<FunctionObj>())?;
        let template = ctx.local(tmpl_loc);
        let frame = ctx.local(frame_loc);

        let src = unsafe { fun_parts(template) };
        let dst = unsafe { ptr.as_mut::<FunctionObj>() };
        dst.name = AtomicUsize::new(src.name.load(Ordering::Acquire));
        dst.module = AtomicUsize::new(src.module.load(Ordering::Acquire));
        dst.closures = AtomicUsize::new(src.closures.load(Ordering::Acquire));
        dst.defaults = AtomicUsize::new(src.defaults.load(Ordering::Acquire));
        dst.generator_frame = AtomicUsize::new(frame.to_bits());
        dst.handler = src.handler;
        dst.state = AtomicU32::new(u32::from(FunctionState::GenReady));
        dst.instr_offs = src.instr_offs;
        dst.def_line = src.def_line;
        dst.flags = src.flags;
        dst.num_args = src.num_args;
        dst.num_regs = src.num_regs;
        dst.args_reg = src.args_reg;
        Ok(Value::from_heap_ptr(ptr))
    })
}

fn set_state(v: Value, state: FunctionState) {
    unsafe { fun_parts(v) }
        .state
        .store(u32::from(state), Ordering::Release);
}

/// Resume a primed or suspended generator by one step. `Ok(None)` means the
/// generator completed; an exception raised inside it propagates and leaves
/// the generator exhausted.
pub fn call_generator(
    ctx: &mut Context,
    func: Value,
    _this: Value,
    args: Value,
) -> Result<Option<Value>> {
    if !func.is_heap_object() || !matches!(func.type_tag(), TypeTag::Function | TypeTag::Class) {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "object is not a function"));
    }
    match function_state(func) {
        FunctionState::GenReady | FunctionState::GenActive => {}
        FunctionState::GenRunning => {
            return Err(ctx.raise(ErrorKind::TypeMismatch, "generator is running"));
        }
        FunctionState::GenDone => return Ok(None),
        _ => {
            return Err(ctx.raise(ErrorKind::NotAGenerator, "function is not a generator"));
        }
    }

    let handler = match unsafe { fun_parts(func) }.handler {
        Some(handler) => handler,
        None => {
            return Err(ctx.raise(
                ErrorKind::TypeMismatch,
                "function has no native handler; bytecode execution lives in the interpreter",
            ));
        }
    };

    ctx.with_scope(|ctx| {
        let func_loc = ctx.push_local(func);
        set_state(func, FunctionState::GenRunning);

        let result = handler(ctx, func, args);
        let func = ctx.local(func_loc);

        match result {
            Ok(v) if !v.is_bad() => {
                set_state(func, FunctionState::GenActive);
                Ok(Some(v))
            }
            Ok(_) => {
                set_state(func, FunctionState::GenDone);
                Ok(None)
            }
            Err(e) => {
                set_state(func, FunctionState::GenDone);
                Err(e)
            }
        }
    })
}

/// Call a function.
///
/// Regular functions invoke their native handler. Calling a generator
/// template returns a primed copy; calling a primed generator resumes it
/// (the bad sentinel, with no pending exception, signals exhaustion).
pub fn call_function(ctx: &mut Context, func: Value, this: Value, args: Value) -> Result<Value> {
    if !func.is_heap_object() || !matches!(func.type_tag(), TypeTag::Function | TypeTag::Class) {
        return Err(ctx.raise(ErrorKind::TypeMismatch, "object is not a function"));
    }

    match function_state(func) {
        FunctionState::Regular => {
            let handler = match unsafe { fun_parts(func) }.handler {
                Some(handler) => handler,
                None => {
                    return Err(ctx.raise(
                        ErrorKind::TypeMismatch,
                        "function has no native handler; bytecode execution lives in the interpreter",
                    ));
                }
            };
            handler(ctx, this, args)
        }
        FunctionState::GenInit => prime_generator(ctx, func),
        _ => Ok(call_generator(ctx, func, this, args)?.unwrap_or(Value::BADPTR)),
    }
}

/// Register of a primed generator's frame; cursor state for native
/// generator handlers.
pub fn generator_reg(func: Value, idx: u32) -> Value {
    let frame = Value::from_bits(
        unsafe { fun_parts(func) }
            .generator_frame
            .load(Ordering::Acquire),
    );
    debug_assert!(!frame.is_bad());
    let stack = unsafe { &*frame.as_obj::<StackObj>() };
    Value::from_bits(unsafe { stack.slot(idx) }.load(Ordering::Acquire))
}

pub fn set_generator_reg(func: Value, idx: u32, v: Value) {
    let frame = Value::from_bits(
        unsafe { fun_parts(func) }
            .generator_frame
            .load(Ordering::Acquire),
    );
    debug_assert!(!frame.is_bad());
    let stack = unsafe { &*frame.as_obj::<StackObj>() };
    unsafe { stack.slot(idx) }.store(v.to_bits(), Ordering::Release);
}

// =========================================================================
// Stacks
// =========================================================================

/// Heap layout of an interpreter stack. Slots follow at
/// [`StackObj::SLOTS_OFFSET`].
#[repr(C)]
pub struct StackObj {
    pub header: ObjectHeader,
    pub capacity: u32,
    pub size: AtomicU32,
}

impl StackObj {
    pub const SLOTS_OFFSET: usize = std::mem::size_of::<StackObj>();

    /// Slot cell at `i`.
    ///
    /// # Safety
    /// `i` must be below `self.capacity`.
    #[inline]
    pub unsafe fn slot(&self, i: u32) -> &AtomicUsize {
        debug_assert!(i < self.capacity);
        unsafe {
            let base = (self as *const Self as *const u8).add(Self::SLOTS_OFFSET);
            &*(base as *const AtomicUsize).add(i as usize)
        }
    }
}

/// Create a value stack with fixed capacity.
pub fn new_stack(ctx: &mut Context, capacity: u32) -> Result<Value> {
    let size = StackObj::SLOTS_OFFSET + capacity as usize * std::mem::size_of::<usize>();
    let ptr = ctx.alloc(TypeTag::Stack, size)?;
    let stack = unsafe { ptr.as_mut::<StackObj>() };
    stack.capacity = capacity;
    stack.size = AtomicU32::new(0);
    for i in 0..capacity {
        unsafe { stack.slot(i) }.store(Value::BADPTR.to_bits(), Ordering::Relaxed);
    }
    Ok(Value::from_heap_ptr(ptr))
}

pub fn stack_push(ctx: &mut Context, stack: Value, v: Value) -> Result<()> {
    let s = unsafe { &*stack.as_obj::<StackObj>() };
    let size = s.size.load(Ordering::Acquire);
    if size >= s.capacity {
        return Err(ctx.raise(ErrorKind::NumericOutOfRange, "stack overflow"));
    }
    unsafe { s.slot(size) }.store(v.to_bits(), Ordering::Release);
    s.size.store(size + 1, Ordering::Release);
    Ok(())
}

pub fn stack_pop(ctx: &mut Context, stack: Value) -> Result<Value> {
    let s = unsafe { &*stack.as_obj::<StackObj>() };
    let size = s.size.load(Ordering::Acquire);
    if size == 0 {
        return Err(ctx.raise(ErrorKind::EmptyCollection, "stack is empty"));
    }
    let slot = unsafe { s.slot(size - 1) };
    let v = Value::from_bits(slot.load(Ordering::Acquire));
    slot.store(Value::BADPTR.to_bits(), Ordering::Release);
    s.size.store(size - 1, Ordering::Release);
    Ok(v)
}

// =========================================================================
// Modules
// =========================================================================

/// Bytecode offset to source line mapping entry.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct LineAddr {
    pub offs: u32,
    pub line: u32,
}

/// Heap layout of a module. Pinned off-heap: the interpreter holds native
/// pointers into `bytecode`.
#[repr(C)]
pub struct ModuleObj {
    pub header: ObjectHeader,
    pub name: AtomicUsize,
    pub path: AtomicUsize,
    /// Value bits of the constants array.
    pub constants: AtomicUsize,
    /// Value bits of the global-name to index object.
    pub global_names: AtomicUsize,
    /// Value bits of the globals array.
    pub globals: AtomicUsize,
    /// Value bits of the referenced-modules object.
    pub module_names: AtomicUsize,
    pub bytecode: *mut u8,
    pub bytecode_size: u32,
    pub _pad: u32,
    pub line_addrs: *mut LineAddr,
    pub num_line_addrs: u32,
    pub _pad2: u32,
}

/// Create a module named `name`. The module object never moves.
pub fn new_module(ctx: &mut Context, name: Value) -> Result<Value> {
    ctx.with_scope(|ctx| {
        let name_loc = ctx.push_local(name);
        let ptr = ctx.alloc_pinned(TypeTag::Module, std::mem::size_of::<ModuleObj>())?;
        let name = ctx.local(name_loc);

        let module = unsafe { ptr.as_mut::<ModuleObj>() };
        module.name = AtomicUsize::new(name.to_bits());
        module.path = AtomicUsize::new(Value::BADPTR.to_bits());
        module.constants = AtomicUsize::new(Value::BADPTR.to_bits());
        module.global_names = AtomicUsize::new(Value::BADPTR.to_bits());
        module.globals = AtomicUsize::new(Value::BADPTR.to_bits());
        module.module_names = AtomicUsize::new(Value::BADPTR.to_bits());
        module.bytecode = std::ptr::null_mut();
        module.bytecode_size = 0;
        module._pad = 0;
        module.line_addrs = std::ptr::null_mut();
        module.num_line_addrs = 0;
        module._pad2 = 0;
        Ok(Value::from_heap_ptr(ptr))
    })
}

/// Attach bytecode; the module owns the copy until it is freed.
pub fn module_set_bytecode(v: Value, bytecode: &[u8]) {
    debug_assert_eq!(v.type_tag(), TypeTag::Module);
    let module = unsafe { &mut *v.as_obj::<ModuleObj>() };
    unsafe { free_module_data(module) };
    let boxed: Box<[u8]> = bytecode.into();
    module.bytecode_size = boxed.len() as u32;
    module.bytecode = Box::into_raw(boxed) as *mut u8;
}

/// Attach the line-address table.
pub fn module_set_line_addrs(v: Value, addrs: &[LineAddr]) {
    debug_assert_eq!(v.type_tag(), TypeTag::Module);
    let module = unsafe { &mut *v.as_obj::<ModuleObj>() };
    if !module.line_addrs.is_null() {
        unsafe {
            drop(Box::from_raw(std::slice::from_raw_parts_mut(
                module.line_addrs,
                module.num_line_addrs as usize,
            )));
        }
        module.line_addrs = std::ptr::null_mut();
        module.num_line_addrs = 0;
    }
    let boxed: Box<[LineAddr]> = addrs.into();
    module.num_line_addrs = boxed.len() as u32;
    module.line_addrs = Box::into_raw(boxed) as *mut LineAddr;
}

/// Source line for a bytecode offset, 0 when unknown.
pub fn module_line_for_offs(v: Value, offs: u32) -> u32 {
    let module = unsafe { &*v.as_obj::<ModuleObj>() };
    let mut line = 0;
    for i in 0..module.num_line_addrs as usize {
        let entry = unsafe { *module.line_addrs.add(i) };
        if entry.offs > offs {
            break;
        }
        line = entry.line;
    }
    line
}

/// Release module-owned native buffers. Called when the module object is
/// freed.
pub(crate) unsafe fn free_module_data(module: &mut ModuleObj) {
    unsafe {
        if !module.bytecode.is_null() {
            drop(Box::from_raw(std::slice::from_raw_parts_mut(
                module.bytecode,
                module.bytecode_size as usize,
            )));
            module.bytecode = std::ptr::null_mut();
            module.bytecode_size = 0;
        }
        if !module.line_addrs.is_null() {
            drop(Box::from_raw(std::slice::from_raw_parts_mut(
                module.line_addrs,
                module.num_line_addrs as usize,
            )));
            module.line_addrs = std::ptr::null_mut();
            module.num_line_addrs = 0;
        }
    }
}
