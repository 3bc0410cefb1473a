//! This module contains the IR framework the lifter targets: a compact,
//! typed, load/store intermediate representation with a textual format.
//!
//! The representation is deliberately small. Values are constants, function
//! arguments, globals or instruction results; instructions live in a
//! per-function arena and blocks hold ordered lists of instruction ids, so
//! passes can detach and splice instructions without invalidating
//! references. The intrinsics module ships as a text file in this dialect
//! and the final devirtualized routine is printed back out in it.

pub mod opt;
pub mod parser;
pub mod printer;
pub mod verifier;

use std::collections::HashMap;

/// The id of a function within a module.
pub type FuncId = usize;

/// The id of a global within a module.
pub type GlobalId = usize;

/// The id of a basic block within a function.
pub type BlockId = usize;

/// The id of an instruction within a function's arena.
pub type InstId = usize;

/// The value types of the representation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Ty {
    I1,
    I8,
    I16,
    I32,
    I64,
    Ptr,
}

impl Ty {
    /// Gets the width of the type in bits.
    ///
    /// # Panics
    ///
    /// Panics for [`Ty::Ptr`]; pointers are opaque and must not be sized by
    /// the caller.
    #[must_use]
    pub fn bits(self) -> u32 {
        match self {
            Self::I1 => 1,
            Self::I8 => 8,
            Self::I16 => 16,
            Self::I32 => 32,
            Self::I64 => 64,
            Self::Ptr => panic!("Pointers are opaque"),
        }
    }

    /// Gets the width of the type in bytes.
    ///
    /// # Panics
    ///
    /// Panics for [`Ty::Ptr`] and [`Ty::I1`], which have no byte width.
    #[must_use]
    pub fn bytes(self) -> u64 {
        match self {
            Self::I8 => 1,
            Self::I16 => 2,
            Self::I32 => 4,
            Self::I64 => 8,
            _ => panic!("Type has no byte width"),
        }
    }

    /// Gets the integer type of the provided bit width.
    #[must_use]
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            1 => Some(Self::I1),
            8 => Some(Self::I8),
            16 => Some(Self::I16),
            32 => Some(Self::I32),
            64 => Some(Self::I64),
            _ => None,
        }
    }

    /// Checks whether the type is an integer type.
    #[must_use]
    pub fn is_int(self) -> bool {
        self != Self::Ptr
    }
}

/// A value: the operand form of the representation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Value {
    /// An integer constant.
    Const { ty: Ty, value: u64 },

    /// An undefined value of the given type.
    Undef { ty: Ty },

    /// The parameter of the containing function at the given index.
    Arg(usize),

    /// A module global.
    Global(GlobalId),

    /// The result of an instruction in the containing function.
    Inst(InstId),
}

impl Value {
    /// Constructs an integer constant.
    #[must_use]
    pub fn const_int(ty: Ty, value: u64) -> Self {
        let masked = if ty == Ty::Ptr || ty.bits() >= 64 {
            value
        } else {
            value & ((1 << ty.bits()) - 1)
        };
        Self::Const { ty, value: masked }
    }

    /// Gets the constant payload of the value, if it is a constant.
    #[must_use]
    pub fn as_const(self) -> Option<u64> {
        match self {
            Self::Const { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// The integer binary operators.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Lshr,
    Ashr,
}

/// The comparison predicates.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Predicate {
    Eq,
    Ne,
    Ult,
    Ule,
    Ugt,
    Uge,
    Slt,
    Sle,
    Sgt,
    Sge,
}

/// The width-changing cast kinds.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CastKind {
    Zext,
    Sext,
    Trunc,
}

/// An instruction.
///
/// Instructions producing a value are referenced as [`Value::Inst`] with
/// their arena id.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Inst {
    /// A stack allocation of `size` zero-initialized bytes, yielding a
    /// pointer.
    Alloca { size: u64 },

    /// A typed load through a pointer.
    Load { ty: Ty, ptr: Value },

    /// A typed store through a pointer.
    Store { ty: Ty, value: Value, ptr: Value },

    /// Pointer arithmetic: `base` advanced by `offset` bytes.
    Gep { base: Value, offset: Value },

    /// An integer binary operation.
    Binary {
        op:  BinaryOp,
        ty:  Ty,
        lhs: Value,
        rhs: Value,
    },

    /// An integer comparison, yielding an `i1`.
    Icmp {
        pred: Predicate,
        ty:   Ty,
        lhs:  Value,
        rhs:  Value,
    },

    /// A select between two values of type `ty`.
    Select {
        cond:      Value,
        ty:        Ty,
        then:      Value,
        otherwise: Value,
    },

    /// A width-changing cast of `value` to `to`.
    Cast { kind: CastKind, to: Ty, value: Value },

    /// A phi joining `incoming` values per predecessor block.
    Phi { ty: Ty, incoming: Vec<(BlockId, Value)> },

    /// A call to `callee` with `args`.
    Call { callee: FuncId, args: Vec<Value> },

    /// An unconditional branch.
    Br { target: BlockId },

    /// A conditional branch on an `i1`.
    CondBr {
        cond:      Value,
        then:      BlockId,
        otherwise: BlockId,
    },

    /// A return, with a value where the function returns one.
    Ret { value: Option<Value> },
}

impl Inst {
    /// Checks whether the instruction terminates a block.
    #[must_use]
    pub fn is_terminator(&self) -> bool {
        matches!(self, Self::Br { .. } | Self::CondBr { .. } | Self::Ret { .. })
    }

    /// Gets the operand values of the instruction.
    #[must_use]
    pub fn operands(&self) -> Vec<Value> {
        match self {
            Self::Alloca { .. } | Self::Br { .. } => vec![],
            Self::Load { ptr, .. } => vec![*ptr],
            Self::Store { value, ptr, .. } => vec![*value, *ptr],
            Self::Gep { base, offset } => vec![*base, *offset],
            Self::Binary { lhs, rhs, .. } | Self::Icmp { lhs, rhs, .. } => vec![*lhs, *rhs],
            Self::Select {
                cond,
                then,
                otherwise,
                ..
            } => vec![*cond, *then, *otherwise],
            Self::Cast { value, .. } => vec![*value],
            Self::Phi { incoming, .. } => incoming.iter().map(|(_, value)| *value).collect(),
            Self::Call { args, .. } => args.clone(),
            Self::CondBr { cond, .. } => vec![*cond],
            Self::Ret { value } => value.map_or_else(Vec::new, |value| vec![value]),
        }
    }

    /// Rewrites every operand of the instruction through `map`.
    pub fn map_operands(&mut self, map: &impl Fn(Value) -> Value) {
        match self {
            Self::Alloca { .. } | Self::Br { .. } => {}
            Self::Load { ptr, .. } => *ptr = map(*ptr),
            Self::Store { value, ptr, .. } => {
                *value = map(*value);
                *ptr = map(*ptr);
            }
            Self::Gep { base, offset } => {
                *base = map(*base);
                *offset = map(*offset);
            }
            Self::Binary { lhs, rhs, .. } | Self::Icmp { lhs, rhs, .. } => {
                *lhs = map(*lhs);
                *rhs = map(*rhs);
            }
            Self::Select {
                cond,
                then,
                otherwise,
                ..
            } => {
                *cond = map(*cond);
                *then = map(*then);
                *otherwise = map(*otherwise);
            }
            Self::Cast { value, .. } => *value = map(*value),
            Self::Phi { incoming, .. } => {
                for (_, value) in incoming {
                    *value = map(*value);
                }
            }
            Self::Call { args, .. } => {
                for arg in args {
                    *arg = map(*arg);
                }
            }
            Self::CondBr { cond, .. } => *cond = map(*cond),
            Self::Ret { value } => {
                if let Some(value) = value {
                    *value = map(*value);
                }
            }
        }
    }
}

/// A basic block: an ordered list of arena instruction ids.
#[derive(Clone, Debug, Default)]
pub struct Block {
    /// The label of the block, used by the textual format.
    pub label: String,

    /// The instructions of the block in execution order.
    pub insts: Vec<InstId>,
}

/// The attributes a function can carry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Attrs {
    /// The function must be inlined into its callers during optimization.
    pub inline: bool,

    /// The function reads no memory; calls to it can be reordered and
    /// deduplicated freely.
    pub pure_fn: bool,

    /// Calls to the function must not be duplicated or merged; used for the
    /// sentinel calls located by name after optimization.
    pub noduplicate: bool,
}

/// A function parameter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty:   Ty,
}

/// A function definition or declaration.
#[derive(Clone, Debug)]
pub struct Function {
    /// The symbol name of the function.
    pub name: String,

    /// The parameters of the function.
    pub params: Vec<Param>,

    /// The return type, or [`None`] for void.
    pub ret: Option<Ty>,

    /// The attributes of the function.
    pub attrs: Attrs,

    /// The instruction arena. Instructions detached by passes stay here as
    /// tombstones; only ids reachable through `blocks` are live.
    pub insts: Vec<Inst>,

    /// The blocks of the function in layout order; the first block is the
    /// entry. Empty for declarations.
    pub blocks: Vec<Block>,
}

impl Function {
    /// Constructs a new function declaration.
    #[must_use]
    pub fn declaration(name: impl Into<String>, params: Vec<Param>, ret: Option<Ty>) -> Self {
        Self {
            name: name.into(),
            params,
            ret,
            attrs: Attrs::default(),
            insts: Vec::new(),
            blocks: Vec::new(),
        }
    }

    /// Checks whether the function is a declaration.
    #[must_use]
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Gets the index of the parameter called `name`.
    #[must_use]
    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|param| param.name == name)
    }

    /// Appends an instruction to the arena and to block `block`, returning
    /// its value.
    pub fn append(&mut self, block: BlockId, inst: Inst) -> Value {
        let id = self.insts.len();
        self.insts.push(inst);
        self.blocks[block].insts.push(id);
        Value::Inst(id)
    }

    /// Appends a new block with `label`, returning its id.
    pub fn add_block(&mut self, label: impl Into<String>) -> BlockId {
        let id = self.blocks.len();
        self.blocks.push(Block {
            label: label.into(),
            insts: Vec::new(),
        });
        id
    }

    /// Gets the type of `value` within this function, or [`None`] for
    /// value-less instructions.
    #[must_use]
    pub fn value_ty(&self, module: &Module, value: Value) -> Option<Ty> {
        match value {
            Value::Const { ty, .. } | Value::Undef { ty } => Some(ty),
            Value::Arg(index) => self.params.get(index).map(|param| param.ty),
            Value::Global(_) => Some(Ty::Ptr),
            Value::Inst(id) => self.inst_ty(module, id),
        }
    }

    /// Gets the result type of instruction `id`, or [`None`] where it
    /// produces no value.
    #[must_use]
    pub fn inst_ty(&self, module: &Module, id: InstId) -> Option<Ty> {
        match &self.insts[id] {
            Inst::Alloca { .. } | Inst::Gep { .. } => Some(Ty::Ptr),
            Inst::Load { ty, .. }
            | Inst::Binary { ty, .. }
            | Inst::Select { ty, .. }
            | Inst::Phi { ty, .. } => Some(*ty),
            Inst::Icmp { .. } => Some(Ty::I1),
            Inst::Cast { to, .. } => Some(*to),
            Inst::Call { callee, .. } => module.function(*callee).ret,
            Inst::Store { .. } | Inst::Br { .. } | Inst::CondBr { .. } | Inst::Ret { .. } => None,
        }
    }

    /// Counts the live instructions of the function.
    #[must_use]
    pub fn inst_count(&self) -> usize {
        self.blocks.iter().map(|block| block.insts.len()).sum()
    }
}

/// A module global.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Global {
    /// The symbol name of the global.
    pub name: String,

    /// The kind and pointee shape of the global.
    pub kind: GlobalKind,
}

/// The pointee shapes of globals.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GlobalKind {
    /// A zero-sized byte array used as a segment base (`RAM`, `GS`, `FS`).
    ByteArray,

    /// A scalar slot of the given type (`__undef`).
    Scalar(Ty),

    /// A constant pointer to the named function (the `SEM_` table).
    FunctionPointer(String),
}

/// A module: globals plus functions.
///
/// Functions are stored in a tombstoning arena so that ids stay stable when
/// ephemeral functions (slices, clones) are erased.
#[derive(Clone, Debug, Default)]
pub struct Module {
    globals: Vec<Global>,
    functions: Vec<Option<Function>>,
    clone_counter: usize,
}

impl Module {
    /// Constructs a new, empty module.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `global` to the module, returning its id.
    pub fn add_global(&mut self, global: Global) -> GlobalId {
        self.globals.push(global);
        self.globals.len() - 1
    }

    /// Gets the global with id `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not minted by this module.
    #[must_use]
    pub fn global(&self, id: GlobalId) -> &Global {
        &self.globals[id]
    }

    /// Gets the id of the global called `name`.
    #[must_use]
    pub fn global_by_name(&self, name: &str) -> Option<GlobalId> {
        self.globals.iter().position(|global| global.name == name)
    }

    /// Iterates the globals of the module with their ids.
    pub fn globals(&self) -> impl Iterator<Item = (GlobalId, &Global)> {
        self.globals.iter().enumerate()
    }

    /// Adds `function` to the module, returning its id.
    pub fn add_function(&mut self, function: Function) -> FuncId {
        self.functions.push(Some(function));
        self.functions.len() - 1
    }

    /// Gets the function with id `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not refer to a live function. Erased functions
    /// must not be referenced; that is a programmer bug.
    #[must_use]
    pub fn function(&self, id: FuncId) -> &Function {
        self.functions[id].as_ref().expect("Function was erased")
    }

    /// Gets the function with id `id` for modification.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not refer to a live function.
    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        self.functions[id].as_mut().expect("Function was erased")
    }

    /// Gets the id of the live function called `name`.
    #[must_use]
    pub fn function_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|function| function.as_ref().is_some_and(|f| f.name == name))
    }

    /// Iterates the live functions of the module with their ids.
    pub fn functions(&self) -> impl Iterator<Item = (FuncId, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .filter_map(|(id, function)| function.as_ref().map(|f| (id, f)))
    }

    /// Clones the function with id `id` under a fresh name, returning the
    /// clone's id.
    pub fn clone_function(&mut self, id: FuncId) -> FuncId {
        let mut clone = self.function(id).clone();
        self.clone_counter += 1;
        clone.name = format!("{}.{}", clone.name, self.clone_counter);
        self.add_function(clone)
    }

    /// Erases the function with id `id` from the module.
    ///
    /// Ephemeral slice functions die through this once the solver has
    /// consumed them.
    pub fn erase_function(&mut self, id: FuncId) {
        self.functions[id] = None;
    }

    /// Checks whether the function with id `id` is live.
    #[must_use]
    pub fn is_live(&self, id: FuncId) -> bool {
        self.functions.get(id).is_some_and(Option::is_some)
    }

    /// Builds the map from semantic name to function id by walking the
    /// `SEM_`-prefixed constant function pointers.
    #[must_use]
    pub fn semantic_table(&self) -> HashMap<String, FuncId> {
        let mut table = HashMap::new();
        for (_, global) in self.globals() {
            if let Some(name) = global.name.strip_prefix("SEM_") {
                if let GlobalKind::FunctionPointer(target) = &global.kind {
                    if let Some(id) = self.function_by_name(target) {
                        table.insert(name.to_owned(), id);
                    }
                }
            }
        }
        table
    }
}
