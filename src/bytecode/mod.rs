//! Bytecode instruction set and program format
//!
//! Programs are produced by an external compiler (or by [`ProgramBuilder`]
//! in tests and embedders). The VM is stack based: most instructions pop
//! their operands from the operand stack and push their result.
//!
//! Jump offsets are relative to the jump instruction itself.

pub mod builder;

pub use builder::{JumpPlaceholder, ProgramBuilder, TryPlaceholder};

use crate::prelude::*;
use crate::value::{JsString, Value};
use std::fmt;

/// Name → slot mapping of a scope record
pub type ScopeNames = FxHashMap<JsString, SlotInfo>;

// ═══════════════════════════════════════════════════════════════════════════════
// Scope layout descriptors
// ═══════════════════════════════════════════════════════════════════════════════

/// Binding flavour of a named slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// Hoisted `var`/function binding; reads of an empty slot give undefined
    Var { deletable: bool },
    /// `let` binding; empty means uninitialised
    Let,
    /// `const` binding; `strict` selects between a type error and a silent
    /// no-op on assignment
    Const { strict: bool },
}

impl BindingKind {
    pub fn is_var(self) -> bool {
        matches!(self, BindingKind::Var { .. })
    }

    pub fn is_lexical(self) -> bool {
        !self.is_var()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub index: u32,
    pub kind: BindingKind,
}

impl SlotInfo {
    pub fn new(index: u32, kind: BindingKind) -> Self {
        SlotInfo { index, kind }
    }
}

/// Build a name map from `(name, kind)` pairs; slot indices follow the order given
pub fn scope_names<'a>(names: impl IntoIterator<Item = (&'a str, BindingKind)>) -> Rc<ScopeNames> {
    let map: ScopeNames = names
        .into_iter()
        .enumerate()
        .map(|(i, (name, kind))| (JsString::from(name), SlotInfo::new(i as u32, kind)))
        .collect();
    Rc::new(map)
}

/// Layout of a block or catch scope
#[derive(Debug, Clone, Default)]
pub struct ScopeLayout {
    pub names: Option<Rc<ScopeNames>>,
    /// Slots in the scope record; 0 means no record is created
    pub stash_size: u32,
    /// Lexical slots reserved on the operand stack
    pub stack_size: u32,
}

/// Function entry that may move arguments into the scope record
#[derive(Debug, Clone, Default)]
pub struct FuncEntry {
    pub names: Option<Rc<ScopeNames>>,
    pub stash_size: u32,
    pub stack_size: u32,
    /// Declared parameter count
    pub num_args: u32,
    /// Copy arguments into stash slots `0..num_args` (closures or eval can see them)
    pub args_to_stash: bool,
}

/// Function entry used when parameters have initialisers: arguments stay
/// on the stack while the first `args_to_copy` are mirrored into the stash
#[derive(Debug, Clone, Default)]
pub struct FuncEntry1 {
    pub names: Option<Rc<ScopeNames>>,
    pub stash_size: u32,
    pub num_args: u32,
    pub args_to_copy: u32,
}

/// Body scope following [`FuncEntry1`]
#[derive(Debug, Clone, Default)]
pub struct FuncBodyEntry {
    pub layout: ScopeLayout,
    /// Reuse the argument region of the stack for body locals
    pub adjust_stack: bool,
}

/// `var` declarations created in the nearest variable scope (direct eval)
#[derive(Debug, Clone, Default)]
pub struct VarBindings {
    pub names: Vec<JsString>,
    pub deletable: bool,
}

/// Global declaration instantiation of a script
#[derive(Debug, Clone, Default)]
pub struct GlobalBindings {
    pub vars: Vec<JsString>,
    pub funcs: Vec<JsString>,
    pub lets: Vec<JsString>,
    pub consts: Vec<JsString>,
    pub deletable: bool,
}

/// `(level, index)` address of a stash slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StashIndex {
    /// Outer links to follow from the current scope
    pub level: u32,
    pub index: u32,
}

impl StashIndex {
    pub fn new(level: u32, index: u32) -> Self {
        StashIndex { level, index }
    }
}

/// Scan `level` dynamic scopes by name, then read a fixed stash slot
#[derive(Debug, Clone)]
pub struct MixedLoad {
    pub name: JsString,
    pub level: u32,
    pub index: u32,
    /// Push a receiver before the value (callee position)
    pub callee: bool,
    /// The fixed slot is a let/const binding
    pub lexical: bool,
}

/// Scan `level` dynamic scopes by name, then read a fixed stack slot
#[derive(Debug, Clone)]
pub struct MixedStackLoad {
    pub name: JsString,
    pub level: u32,
    /// Stack slot as addressed by `LoadStack`/`LoadStack1`
    pub index: i32,
    pub callee: bool,
    pub lexical: bool,
    /// The function keeps its arguments in the stash (`LoadStack1` addressing)
    pub args_in_stash: bool,
}

/// Scan `level` dynamic scopes by name, then reference a fixed stash slot
#[derive(Debug, Clone)]
pub struct MixedResolve {
    pub name: JsString,
    pub level: u32,
    pub index: u32,
    pub kind: BindingKind,
    pub strict: bool,
}

/// Scan `level` dynamic scopes by name, then reference a fixed stack slot
#[derive(Debug, Clone)]
pub struct MixedStackResolve {
    pub name: JsString,
    pub level: u32,
    pub index: i32,
    pub kind: BindingKind,
    pub strict: bool,
    pub args_in_stash: bool,
}

/// Compiled function body plus the metadata a closure needs
#[derive(Debug, Clone)]
pub struct FuncTemplate {
    pub program: Rc<Program>,
    pub name: JsString,
    /// Value of the `length` property
    pub length: u32,
    pub strict: bool,
}

impl FuncTemplate {
    pub fn new(program: Rc<Program>, length: u32, strict: bool) -> Rc<Self> {
        let name = program.func_name.clone();
        Rc::new(FuncTemplate {
            program,
            name,
            length,
            strict,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Instructions
// ═══════════════════════════════════════════════════════════════════════════════

/// Bytecode instruction
///
/// Stack-slot operands (`i32`) address the current function frame: a positive
/// index is a local after the arguments, 0 is `this`, a negative index is the
/// argument at position `-index` (1-based).
#[derive(Debug, Clone)]
pub enum Instruction {
    // ═══════════════════════════════════════════════════════════════════════════
    // Constants & Stack Operations
    // ═══════════════════════════════════════════════════════════════════════════
    /// Push `values[idx]`
    LoadVal(u32),

    /// Push undefined
    LoadUndef,

    /// Push the empty marker (a hole or an uninitialised slot)
    LoadEmpty,

    /// Push the global object
    LoadGlobalObject,

    /// Push the running function (the callee slot below `this`)
    LoadCallee,

    /// Push `new.target`
    LoadNewTarget,

    /// Pop into the program's completion value
    SaveResult,

    /// Reset the completion value to undefined
    ClearResult,

    Pop,

    Dup,

    /// Push a copy of the value `n` slots below the top
    DupN(u32),

    /// Copy the top into the slot `n` below it
    RDupN(u32),

    /// Stop the current dispatch loop
    Halt,

    // ═══════════════════════════════════════════════════════════════════════════
    // Stack Slots
    // ═══════════════════════════════════════════════════════════════════════════
    /// Push a stack slot (var semantics)
    LoadStack(i32),

    /// Push a stack slot in a function whose arguments live in the stash
    LoadStack1(i32),

    /// Push a let/const stack slot; raises when uninitialised
    LoadStackLex(i32),

    LoadStack1Lex(i32),

    /// Store the top into a stack slot, optionally popping it
    StoreStack { index: i32, pop: bool },

    StoreStack1 { index: i32, pop: bool },

    /// Store into a let stack slot; raises when uninitialised
    StoreStackLex { index: i32, pop: bool },

    StoreStack1Lex { index: i32, pop: bool },

    /// Pop into a stack slot, initialising it
    InitStack(i32),

    InitStack1(i32),

    // ═══════════════════════════════════════════════════════════════════════════
    // Stash Slots
    // ═══════════════════════════════════════════════════════════════════════════
    /// Push a stash slot (var semantics)
    LoadStash(StashIndex),

    /// Push a let/const stash slot; raises when uninitialised
    LoadStashLex(StashIndex),

    StoreStash { at: StashIndex, pop: bool },

    /// Store into a let stash slot; raises when uninitialised
    StoreStashLex { at: StashIndex, pop: bool },

    /// Pop into a stash slot, initialising it
    InitStash(StashIndex),

    /// Pop into a global lexical binding, initialising it
    InitGlobal(JsString),

    // ═══════════════════════════════════════════════════════════════════════════
    // Dynamic Name Resolution
    // ═══════════════════════════════════════════════════════════════════════════
    LoadMixed(Rc<MixedLoad>),

    LoadMixedStack(Rc<MixedStackLoad>),

    /// Push a reference onto the reference stack
    ResolveMixed(Rc<MixedResolve>),

    ResolveMixedStack(Rc<MixedStackResolve>),

    /// Resolve a name through the whole chain into a reference. Sloppy code
    /// falls back to a global-object reference, strict code to an
    /// unresolved one when the global object lacks the property.
    ResolveVar1 { name: JsString, strict: bool },

    /// Push the value of a name; raises when it does not resolve
    LoadDynamic(JsString),

    /// Like `LoadDynamic` but pushes an unresolved marker instead of raising
    LoadDynamicRef(JsString),

    /// Push receiver and value of a name for a call
    LoadDynamicCallee(JsString),

    /// `delete name`; pushes the result
    DeleteVar(JsString),

    /// `delete name` at global scope
    DeleteGlobal(JsString),

    /// Assign the top to a global name (the value stays on the stack)
    SetGlobal { name: JsString, strict: bool },

    /// Push the value of the top reference, which stays on the reference stack
    GetValue,

    /// Pop a reference and store the top into it
    PutValue { pop: bool },

    /// Pop a reference and initialise it with the popped top
    InitValueP,

    // ═══════════════════════════════════════════════════════════════════════════
    // Arithmetic & Bitwise
    // ═══════════════════════════════════════════════════════════════════════════
    ToNumber,

    Add,

    Sub,

    Mul,

    Div,

    Mod,

    Neg,

    /// Unary plus
    Plus,

    Inc,

    Dec,

    And,

    Or,

    Xor,

    /// Bitwise not
    BNot,

    /// Left shift
    Sal,

    /// Signed right shift
    Sar,

    /// Unsigned right shift
    Shr,

    // ═══════════════════════════════════════════════════════════════════════════
    // Comparison & Logic
    // ═══════════════════════════════════════════════════════════════════════════
    Not,

    Lt,

    Lte,

    Gt,

    Gte,

    Eq,

    Neq,

    StrictEq,

    StrictNeq,

    InstanceOf,

    In,

    TypeOf,

    ToPropertyKey,

    ToString,

    /// Concatenate the top `n` values as strings
    ConcatStrings(u32),

    // ═══════════════════════════════════════════════════════════════════════════
    // Jumps
    // ═══════════════════════════════════════════════════════════════════════════
    Jump(i32),

    /// Pop; jump when falsy
    Jne(i32),

    /// Pop; jump when truthy
    Jeq(i32),

    /// Jump when the top is truthy; the value stays on the stack (`||`)
    Jeq1(i32),

    /// Jump when the top is falsy; the value stays on the stack (`&&`)
    Jneq1(i32),

    /// Jump when the top is not undefined, else pop (default values)
    Jdef(i32),

    /// Pop; jump when it was not undefined
    JdefP(i32),

    // ═══════════════════════════════════════════════════════════════════════════
    // Properties & Literals
    // ═══════════════════════════════════════════════════════════════════════════
    /// `obj.name`: replace the top with the property value
    GetProp(JsString),

    /// `obj.name` in callee position: a missing member becomes an unresolved
    /// marker so the call reports it by name
    GetPropCallee(JsString),

    /// `obj[key]`: pops key and object
    GetElem,

    /// Like `GetElem` with an already converted key
    GetKey,

    /// `obj[key]` in callee position
    GetElemCallee,

    /// `obj.name = value`
    SetProp { name: JsString, strict: bool, pop: bool },

    /// `obj[key] = value`
    SetElem { strict: bool, pop: bool },

    /// Object literal computed member: `[obj, key, value]` → `[obj]`
    SetElem1,

    /// Object literal member: `[obj, value]` → `[obj]`
    SetProp1(JsString),

    /// Object literal `__proto__: value`
    SetProto,

    /// Push a property reference for `obj.name`
    GetPropRef { name: JsString, strict: bool },

    /// Push a property reference for `obj[key]`
    GetElemRef { strict: bool },

    DeleteProp { name: JsString, strict: bool },

    DeleteElem { strict: bool },

    NewObject,

    /// Push an empty array with room for `n` items
    NewArray(u32),

    /// `[arr, value]` → `[arr]` with value appended
    PushArrayItem,

    /// `[arr, iterable]` → `[arr]` with every item appended
    PushArraySpread,

    /// Pop an iterable and push all its items (variadic calls)
    PushSpread,

    /// Pop the top iterator record and push an array of its remaining items
    NewArrayFromIter,

    /// `[target, source]` → `[target]` with source's own enumerable properties copied
    CopySpread,

    /// `[source]` → `[source, rest]` where rest is a fresh copy (object rest pattern)
    CopyRest,

    /// Raise when the top is null or undefined
    CheckObjectCoercible,

    // ═══════════════════════════════════════════════════════════════════════════
    // Calls
    // ═══════════════════════════════════════════════════════════════════════════
    /// Push the variadic marker
    StartVariadic,

    /// Call with the argument count measured from the variadic marker
    CallVariadic,

    /// Drop the variadic marker below the result
    EndVariadic,

    NewVariadic,

    CallEvalVariadic { strict: bool },

    /// `[this, callee, args...]` → `[result]`
    Call(u32),

    /// Direct `eval(...)` candidate
    CallEval { args: u32, strict: bool },

    /// `[callee, args...]` → `[result]`
    New(u32),

    /// Return the top of the stack from the current function
    Ret,

    /// Sloppy-mode `this` boxing
    BoxThis,

    // ═══════════════════════════════════════════════════════════════════════════
    // Functions & Scopes
    // ═══════════════════════════════════════════════════════════════════════════
    NewFunc(Rc<FuncTemplate>),

    NewMethod(Rc<FuncTemplate>),

    NewArrowFunc(Rc<FuncTemplate>),

    EnterFunc(Rc<FuncEntry>),

    EnterFunc1(Rc<FuncEntry1>),

    EnterFuncBody(Rc<FuncBodyEntry>),

    /// Function entry without a scope record
    EnterFuncStashless { stack_size: u32, num_args: u32 },

    EnterBlock(Rc<ScopeLayout>),

    /// Enter a catch scope; the caught value on the stack moves into slot 0
    EnterCatchBlock(Rc<ScopeLayout>),

    LeaveBlock { stack_size: u32, pop_stash: bool },

    /// Replace the current scope record with a copy (per-iteration bindings)
    CopyStash,

    BindVars(Rc<VarBindings>),

    BindGlobal(Rc<GlobalBindings>),

    /// Arguments object whose indices alias the first `n` stash slots
    CreateArgsMapped(u32),

    CreateArgsUnmapped(u32),

    /// Rest parameter from stack arguments after the first `n`
    CreateArgsRestStack(u32),

    /// Rest parameter from the stash's extra arguments
    CreateArgsRestStash,

    /// Pop an object and make it the innermost scope
    EnterWith,

    LeaveWith,

    // ═══════════════════════════════════════════════════════════════════════════
    // Iteration
    // ═══════════════════════════════════════════════════════════════════════════
    /// Pop an object and open a for-in cursor
    Enumerate,

    /// Advance the top cursor; jump when exhausted
    EnumNext(i32),

    /// Push the current value of the top iterator record
    EnumGet,

    EnumPop,

    /// Pop the top iterator record and close it
    EnumPopClose,

    /// Open an iterator record over the top value, which stays on the stack
    Iterate,

    /// Pop an iterable and open an iterator record
    IterateP,

    /// Step the top iterator; jump when done
    IterNext(i32),

    /// Push the next item or undefined once done (array destructuring)
    IterGetNextOrUndef,

    // ═══════════════════════════════════════════════════════════════════════════
    // Exceptions
    // ═══════════════════════════════════════════════════════════════════════════
    /// Run a guarded region. Offsets are relative to this instruction; 0 means absent.
    Try { catch_offset: i32, finally_offset: i32 },

    /// Marks the normal end of a finally section
    RetFinally,

    Throw,

    ThrowAssignToConst(JsString),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Programs
// ═══════════════════════════════════════════════════════════════════════════════

/// Source text and name for position lookups
#[derive(Debug)]
pub struct SourceFile {
    pub name: String,
    pub text: String,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        SourceFile {
            name: name.into(),
            text: text.into(),
        }
    }

    /// 1-based line and column of a byte offset
    pub fn position(&self, offset: u32) -> (u32, u32) {
        let mut line = 1;
        let mut column = 1;
        for (i, c) in self.text.char_indices() {
            if i >= offset as usize {
                break;
            }
            if c == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        }
        (line, column)
    }
}

/// Source map entry: instructions from `pc` on belong to `offset`
#[derive(Debug, Clone, Copy)]
pub struct SourceMapEntry {
    pub pc: usize,
    pub offset: u32,
}

/// Compiled program or function body
pub struct Program {
    pub code: Vec<Instruction>,
    /// Constant pool
    pub values: Vec<Value>,
    pub func_name: JsString,
    pub source: Option<Rc<SourceFile>>,
    /// Sorted by `pc`
    pub source_map: Vec<SourceMapEntry>,
}

impl Program {
    #[inline]
    pub fn get(&self, pc: usize) -> Option<&Instruction> {
        self.code.get(pc)
    }

    #[inline]
    pub fn constant(&self, idx: u32) -> Option<&Value> {
        self.values.get(idx as usize)
    }

    /// Source line and column of an instruction
    pub fn source_position(&self, pc: usize) -> Option<(u32, u32)> {
        let source = self.source.as_ref()?;
        let idx = match self.source_map.binary_search_by_key(&pc, |e| e.pc) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let entry = self.source_map.get(idx)?;
        Some(source.position(entry.offset))
    }

    pub fn source_name(&self) -> Option<&str> {
        self.source.as_ref().map(|s| s.name.as_str())
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("func_name", &self.func_name)
            .field("code", &self.code.len())
            .field("values", &self.values.len())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Compiler hook
// ═══════════════════════════════════════════════════════════════════════════════

/// How an eval'd source is compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    pub strict: bool,
    /// Direct eval sees the caller's scope
    pub direct_eval: bool,
    pub in_function: bool,
}

/// Source compiler used by `eval`. Errors become script SyntaxErrors.
pub trait ScriptCompiler {
    fn compile(&self, source: &JsString, options: CompileOptions) -> Result<Rc<Program>, String>;
}
