//! This module contains the branch-target enumeration: the bridge from an
//! IR value to a symbolic expression, and the bounded model search that
//! concretizes the possible destinations of a computed branch.
//!
//! The bridge turns loads, arguments, globals and opaque instructions into
//! free variables and everything else into the corresponding expression
//! node. Enumeration then forces the comparison atoms of the expression
//! through all of their assignments, keeping every outcome that is
//! independent of the remaining free variables, under the constraint chain
//! `target != 0`, `target != <already seen>`. A branch with more than
//! [`SOLVER_MAXIMUM_TARGETS`] destinations is a jump table and is reported
//! as unsolvable.

use std::collections::HashMap;

use log::{info, warn};

use crate::{
    constant::{SOLVER_MAXIMUM_ATOMS, SOLVER_MAXIMUM_TARGETS},
    emu::ast::{self, BinOp, Expr, ExprRef, Variable},
    error::solving::{Error, Result},
    il::{self, BinaryOp, CastKind, Inst, Module, Predicate, Ty, Value},
};

/// The diagnostic switches of the solver.
#[derive(Clone, Copy, Debug, Default)]
pub struct Options {
    /// Write every branch expression to a `branch-ast-N.dot` file.
    pub save_ast: bool,

    /// Log every branch expression ahead of enumeration.
    pub print_ast: bool,
}

/// The branch-target solver.
#[derive(Debug, Default)]
pub struct Solver {
    options: Options,

    /// The running index of the saved branch-expression dot files.
    dot_counter: usize,
}

impl Solver {
    /// Constructs a new solver with the provided diagnostic `options`.
    #[must_use]
    pub fn new(options: Options) -> Self {
        let dot_counter = 0;
        Self {
            options,
            dot_counter,
        }
    }

    /// Enumerates the concrete destinations the branch value `value` of
    /// `function` can take.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the value cannot be bridged to an expression.
    pub fn possible_targets(
        &mut self,
        module: &Module,
        function: &il::Function,
        value: Value,
    ) -> Result<Vec<u64>> {
        let mut bridge = Bridge::new(module, function);
        let expr = match disjoint_or(function, value) {
            Some((lhs, rhs)) => {
                // The VM emits `or` where the operands are arithmetically
                // disjoint; the additive form simplifies better downstream.
                warn!("replacing or with add.");
                let lhs = bridge.convert(lhs)?;
                let rhs = bridge.convert(rhs)?;
                Expr::binary(BinOp::Add, lhs, rhs)
            }
            None => bridge.convert(value)?,
        };

        if self.options.save_ast {
            let path = format!("branch-ast-{}.dot", self.dot_counter);
            self.dot_counter += 1;
            if let Err(error) = ast::save_dot(&expr, &path) {
                warn!("Failed to save branch expression to {path}: {error}");
            }
        }
        if self.options.print_ast {
            info!("branch ast: {expr}");
        }

        Ok(enumerate(&expr))
    }

}

/// Checks whether `value` is an `or` whose operands provably share no bits,
/// returning the operands if so.
///
/// Disjointness is established over the known-zero-bit masks of the
/// operands; where it cannot be proven the rewrite is skipped with a
/// warning, since the additive form would then change the value.
fn disjoint_or(function: &il::Function, value: Value) -> Option<(Value, Value)> {
    let Value::Inst(id) = value else {
        return None;
    };
    let Inst::Binary {
        op: BinaryOp::Or,
        lhs,
        rhs,
        ..
    } = &function.insts[id]
    else {
        return None;
    };

    let lhs_known = known_zero_bits(function, *lhs, 0);
    let rhs_known = known_zero_bits(function, *rhs, 0);
    if !lhs_known & !rhs_known == 0 {
        return Some((*lhs, *rhs));
    }
    warn!("or operands may share bits; keeping the disjunction.");
    None
}

/// Computes a mask of the bits of `value` that are provably zero.
fn known_zero_bits(function: &il::Function, value: Value, depth: usize) -> u64 {
    if depth > 16 {
        return 0;
    }
    match value {
        Value::Const { ty, value } => !value & ty_mask(ty),
        Value::Inst(id) => match &function.insts[id] {
            Inst::Binary { op, ty, lhs, rhs } => {
                let (a, b) = (
                    known_zero_bits(function, *lhs, depth + 1),
                    known_zero_bits(function, *rhs, depth + 1),
                );
                match op {
                    BinaryOp::And => a | b,
                    BinaryOp::Or | BinaryOp::Xor => a & b,
                    BinaryOp::Shl => {
                        rhs.as_const().map_or(0, |shift| {
                            let low = if shift >= 64 { u64::MAX } else { (1 << shift) - 1 };
                            (a << shift.min(63)) | low | !ty_mask(*ty)
                        })
                    }
                    BinaryOp::Lshr => rhs.as_const().map_or(0, |shift| {
                        let shifted = !(!a >> shift.min(63));
                        shifted | !ty_mask(*ty)
                    }),
                    _ => !ty_mask(*ty),
                }
            }
            Inst::Cast {
                kind: CastKind::Zext,
                to,
                value,
            } => {
                let inner_ty = function_value_bits(function, *value);
                known_zero_bits(function, *value, depth + 1)
                    | (!0u64 << inner_ty.min(63))
                    | !ty_mask(*to)
            }
            _ => 0,
        },
        _ => 0,
    }
}

fn function_value_bits(function: &il::Function, value: Value) -> u32 {
    match value {
        Value::Const { ty, .. } | Value::Undef { ty } => bits_of(ty),
        Value::Arg(index) => bits_of(function.params[index].ty),
        _ => 64,
    }
}

fn ty_mask(ty: Ty) -> u64 {
    let bits = bits_of(ty);
    if bits >= 64 {
        u64::MAX
    } else {
        (1 << bits) - 1
    }
}

fn bits_of(ty: Ty) -> u32 {
    match ty {
        Ty::Ptr => 64,
        other => other.bits(),
    }
}

/// The bridge from IR values to symbolic expressions.
struct Bridge<'m> {
    module: &'m Module,
    function: &'m il::Function,
    cache: HashMap<Value, ExprRef>,
    next_variable: u64,
}

impl<'m> Bridge<'m> {
    fn new(module: &'m Module, function: &'m il::Function) -> Self {
        Self {
            module,
            function,
            cache: HashMap::new(),
            next_variable: 0,
        }
    }

    /// Mints a fresh free variable for an opaque value.
    fn fresh(&mut self, alias: impl Into<String>, bits: u32) -> ExprRef {
        let variable = Variable::new(self.next_variable, alias, bits, 0);
        self.next_variable += 1;
        Expr::var(variable)
    }

    /// Converts `value` into an expression, minting free variables for
    /// everything the expression language cannot express.
    fn convert(&mut self, value: Value) -> Result<ExprRef> {
        if let Some(cached) = self.cache.get(&value) {
            return Ok(cached.clone());
        }
        let expr = self.convert_uncached(value)?;
        self.cache.insert(value, expr.clone());
        Ok(expr)
    }

    fn convert_uncached(&mut self, value: Value) -> Result<ExprRef> {
        match value {
            Value::Const { ty, value } => Ok(Expr::constant(value, bits_of(ty))),
            Value::Undef { ty } => Ok(self.fresh("undef", bits_of(ty))),
            Value::Arg(index) => {
                let param = &self.function.params[index];
                let bits = bits_of(param.ty);
                let alias = param.name.clone();
                Ok(self.fresh(alias, bits))
            }
            Value::Global(id) => {
                let alias = format!("@{}", self.module.global(id).name);
                Ok(self.fresh(alias, 64))
            }
            Value::Inst(id) => self.convert_inst(id),
        }
    }

    fn convert_inst(&mut self, id: il::InstId) -> Result<ExprRef> {
        let inst = self.function.insts[id].clone();
        match inst {
            Inst::Load { ty, .. } => Ok(self.fresh(format!("load.{id}"), bits_of(ty))),
            Inst::Alloca { .. } => Ok(self.fresh(format!("alloca.{id}"), 64)),
            Inst::Phi { ty, .. } => Ok(self.fresh(format!("phi.{id}"), bits_of(ty))),
            Inst::Call { callee, .. } => {
                let bits = self.module.function(callee).ret.map_or(64, bits_of);
                Ok(self.fresh(format!("call.{id}"), bits))
            }
            Inst::Store { .. } | Inst::Br { .. } | Inst::CondBr { .. } | Inst::Ret { .. } => {
                Err(Error::UnsupportedValue {
                    reason: "the value names an instruction with no result".to_owned(),
                })
            }
            Inst::Gep { base, offset } => {
                let base = self.convert(base)?;
                let offset = self.convert(offset)?;
                Ok(Expr::binary(BinOp::Add, base, offset))
            }
            Inst::Binary { op, lhs, rhs, .. } => {
                let lhs = self.convert(lhs)?;
                let rhs = self.convert(rhs)?;
                let op = match op {
                    BinaryOp::Add => BinOp::Add,
                    BinaryOp::Sub => BinOp::Sub,
                    BinaryOp::Mul => BinOp::Mul,
                    BinaryOp::And => BinOp::And,
                    BinaryOp::Or => BinOp::Or,
                    BinaryOp::Xor => BinOp::Xor,
                    BinaryOp::Shl => BinOp::Shl,
                    BinaryOp::Lshr => BinOp::Lshr,
                    BinaryOp::Ashr => BinOp::Ashr,
                };
                Ok(Expr::binary(op, lhs, rhs))
            }
            Inst::Icmp { pred, lhs, rhs, .. } => {
                let a = self.convert(lhs)?;
                let b = self.convert(rhs)?;
                let expr = match pred {
                    Predicate::Eq => Expr::binary(BinOp::Eq, a, b),
                    Predicate::Ne => Expr::binary(BinOp::Ne, a, b),
                    Predicate::Ult => Expr::binary(BinOp::Ult, a, b),
                    Predicate::Ule => Expr::binary(BinOp::Ule, a, b),
                    Predicate::Ugt => Expr::binary(BinOp::Ult, b, a),
                    Predicate::Uge => Expr::binary(BinOp::Ule, b, a),
                    Predicate::Slt => Expr::binary(BinOp::Slt, a, b),
                    Predicate::Sle => Expr::binary(BinOp::Sle, a, b),
                    Predicate::Sgt => Expr::binary(BinOp::Slt, b, a),
                    Predicate::Sge => Expr::binary(BinOp::Sle, b, a),
                };
                Ok(expr)
            }
            Inst::Select {
                cond,
                then,
                otherwise,
                ..
            } => {
                let cond = self.convert(cond)?;
                let then = self.convert(then)?;
                let otherwise = self.convert(otherwise)?;
                Ok(Expr::ite(cond, then, otherwise))
            }
            Inst::Cast { kind, to, value } => {
                let inner = self.convert(value)?;
                let to = bits_of(to);
                Ok(match kind {
                    CastKind::Zext => Expr::zext(to, inner),
                    CastKind::Sext => Expr::sext(to, inner),
                    CastKind::Trunc => Expr::extract(to - 1, 0, inner),
                })
            }
        }
    }
}

/// Enumerates the concrete values of `expr` by forcing its comparison
/// atoms, under the constraint chain `value != 0, value != seen...`.
fn enumerate(expr: &ExprRef) -> Vec<u64> {
    let baseline = ast::Model::new();
    let mut ones = ast::Model::new();
    for variable in ast::collect_variables(expr) {
        ones.insert(variable.id(), u64::MAX);
    }

    if ast::collect_variables(expr).is_empty() {
        return vec![expr.evaluate(&baseline)];
    }

    // The choice atoms are the distinct comparison nodes of the tree.
    let mut atoms: Vec<*const Expr> = Vec::new();
    ast::walk(expr, &mut |node| {
        if let Expr::Binary { op, .. } = node {
            if op.is_comparison() {
                let key = node as *const Expr;
                if !atoms.contains(&key) {
                    atoms.push(key);
                }
            }
        }
    });
    if atoms.is_empty() || atoms.len() > SOLVER_MAXIMUM_ATOMS {
        return Vec::new();
    }

    let mut targets: Vec<u64> = Vec::new();
    for assignment in 0u32..(1 << atoms.len()) {
        let mut forced: HashMap<*const Expr, u64> = HashMap::new();
        for (index, atom) in atoms.iter().enumerate() {
            forced.insert(*atom, u64::from(assignment >> index & 1));
        }

        // An outcome still swayed by the free variables is not a concrete
        // destination.
        let under_zeros = expr.evaluate_forced(&baseline, &forced);
        let under_ones = expr.evaluate_forced(&ones, &forced);
        if under_zeros != under_ones {
            continue;
        }
        let target = under_zeros;
        if target == 0 || targets.contains(&target) {
            continue;
        }
        targets.push(target);

        // Failsafe: more than two distinct destinations is a jump table.
        if targets.len() > SOLVER_MAXIMUM_TARGETS {
            return Vec::new();
        }
    }
    targets
}

#[cfg(test)]
mod test {
    use crate::{
        il::{parser::parse_module, Inst, Value},
        solver::{Options, Solver},
    };

    /// Builds a module, returning the value returned by `f` and the solver
    /// inputs.
    fn returned_value(text: &str) -> (crate::il::Module, crate::il::FuncId, Value) {
        let module = parse_module(text).expect("fixture parses");
        let id = module.function_by_name("f").unwrap();
        let function = module.function(id);
        let ret = function
            .blocks
            .iter()
            .flat_map(|block| &block.insts)
            .find_map(|inst_id| match &function.insts[*inst_id] {
                Inst::Ret { value: Some(value) } => Some(*value),
                _ => None,
            })
            .expect("fixture returns a value");
        (module, id, ret)
    }

    #[test]
    fn constant_branches_have_one_target() -> anyhow::Result<()> {
        let (module, id, value) =
            returned_value("define f() -> i64 {\nentry:\n  ret i64 4096\n}\n");
        let mut solver = Solver::new(Options::default());
        let targets = solver.possible_targets(&module, module.function(id), value)?;

        assert_eq!(targets, vec![0x1000]);
        Ok(())
    }

    #[test]
    fn selects_enumerate_both_destinations() -> anyhow::Result<()> {
        let (module, id, value) = returned_value(
            "define f(p: ptr) -> i64 {\nentry:\n  %x = load i64, ptr %p\n  \
             %c = icmp eq i64 %x, 0\n  %t = select i1 %c, i64 4096, i64 8192\n  \
             ret i64 %t\n}\n",
        );
        let mut solver = Solver::new(Options::default());
        let targets = solver.possible_targets(&module, module.function(id), value)?;

        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&0x1000));
        assert!(targets.contains(&0x2000));
        Ok(())
    }

    #[test]
    fn enumeration_is_idempotent() -> anyhow::Result<()> {
        let (module, id, value) = returned_value(
            "define f(p: ptr) -> i64 {\nentry:\n  %x = load i64, ptr %p\n  \
             %c = icmp ult i64 %x, 16\n  %t = select i1 %c, i64 4096, i64 8192\n  \
             ret i64 %t\n}\n",
        );
        let mut solver = Solver::new(Options::default());
        let first = solver.possible_targets(&module, module.function(id), value)?;
        let second = solver.possible_targets(&module, module.function(id), value)?;

        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn unresolved_values_produce_no_targets() -> anyhow::Result<()> {
        // The branch value is a bare load; nothing pins it down.
        let (module, id, value) = returned_value(
            "define f(p: ptr) -> i64 {\nentry:\n  %x = load i64, ptr %p\n  ret i64 %x\n}\n",
        );
        let mut solver = Solver::new(Options::default());
        let targets = solver.possible_targets(&module, module.function(id), value)?;

        assert!(targets.is_empty());
        Ok(())
    }

    #[test]
    fn arithmetic_selection_enumerates_like_a_select() -> anyhow::Result<()> {
        // target = 0x1000 + zext(cond) * 0x1000, the arithmetic encoding the
        // VM prefers over a plain select.
        let (module, id, value) = returned_value(
            "define f(p: ptr) -> i64 {\nentry:\n  %x = load i64, ptr %p\n  \
             %c = icmp eq i64 %x, 0\n  %w = zext i1 %c to i64\n  \
             %off = mul i64 %w, 4096\n  %t = add i64 4096, %off\n  ret i64 %t\n}\n",
        );
        let mut solver = Solver::new(Options::default());
        let targets = solver.possible_targets(&module, module.function(id), value)?;

        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&0x1000));
        assert!(targets.contains(&0x2000));
        Ok(())
    }
}
