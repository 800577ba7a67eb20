//! Symbol resolution: the resolver capability and the per-call symbol table.
//!
//! Lookup order is labels defined in the source, then constants
//! (`.equ` and friends), then the installed [`SymbolResolver`]. Resolver
//! answers are cached for the duration of one assemble call.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{ErrorCode, Fault, Span};
use crate::ir::{apply, Expr};

/// Supplies values for symbols that are neither labels nor constants.
///
/// Implemented for every `FnMut(&str) -> Option<u64>` closure:
///
/// ```
/// use ks_asm::{Arch, Engine, Mode};
///
/// let mut engine = Engine::open(Arch::X86, Mode::Mode32)?;
/// engine.set_symbol_resolver(|name: &str| (name == "TEST").then_some(0x66))?;
/// let out = engine.assemble("mov eax, TEST", 0)?;
/// assert_eq!(&out.machine_code()[..2], &[0xB8, 0x66]);
/// # Ok::<(), ks_asm::Error>(())
/// ```
pub trait SymbolResolver {
    /// Value of `name` (exact case), or `None` if the symbol is unknown.
    fn resolve(&mut self, name: &str) -> Option<u64>;
}

impl<F> SymbolResolver for F
where
    F: FnMut(&str) -> Option<u64>,
{
    fn resolve(&mut self, name: &str) -> Option<u64> {
        self(name)
    }
}

/// Result of evaluating an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Value {
    pub value: i128,
    /// Depends on a label or the current address, so it may move between
    /// layout passes.
    pub relocatable: bool,
}

impl Value {
    pub fn constant(value: i128) -> Self {
        Self {
            value,
            relocatable: false,
        }
    }
}

/// Symbols visible to one assemble call.
pub(crate) struct SymbolTable<'r> {
    /// Every label defined anywhere in the source.
    label_names: BTreeSet<String>,
    /// Latest known address of each label.
    labels: BTreeMap<String, u64>,
    constants: BTreeMap<String, (Expr, Span)>,
    cache: BTreeMap<String, Option<u64>>,
    resolver: Option<&'r mut (dyn SymbolResolver + Send)>,
    max_depth: usize,
}

impl<'r> SymbolTable<'r> {
    pub fn new(resolver: Option<&'r mut (dyn SymbolResolver + Send)>, max_depth: usize) -> Self {
        Self {
            label_names: BTreeSet::new(),
            labels: BTreeMap::new(),
            constants: BTreeMap::new(),
            cache: BTreeMap::new(),
            resolver,
            max_depth,
        }
    }

    /// Register a label name before layout.
    pub fn declare_label(&mut self, name: &str, span: Span) -> Result<(), Fault> {
        if self.label_names.contains(name) || self.constants.contains_key(name) {
            return Err(redefined(name, span));
        }
        self.label_names.insert(String::from(name));
        Ok(())
    }

    /// Register a constant definition before layout.
    pub fn declare_constant(&mut self, name: &str, expr: Expr, span: Span) -> Result<(), Fault> {
        if self.label_names.contains(name) || self.constants.contains_key(name) {
            return Err(redefined(name, span));
        }
        self.constants.insert(String::from(name), (expr, span));
        Ok(())
    }

    /// Record the address of a label in the current layout pass.
    pub fn place_label(&mut self, name: &str, addr: u64) {
        if let Some(slot) = self.labels.get_mut(name) {
            *slot = addr;
        } else {
            self.labels.insert(String::from(name), addr);
        }
    }

    /// Snapshot of label addresses, for convergence checks.
    pub fn label_addresses(&self) -> Vec<(String, u64)> {
        self.labels
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Evaluate `expr` at address `here`.
    ///
    /// A label not yet placed in any pass evaluates to `here`; the layout
    /// pass iterates until every label has a stable address.
    pub fn eval(&mut self, expr: &Expr, here: u64) -> Result<Value, Fault> {
        let mut stack = Vec::new();
        self.eval_inner(expr, here, &mut stack)
    }

    fn eval_inner(
        &mut self,
        expr: &Expr,
        here: u64,
        stack: &mut Vec<String>,
    ) -> Result<Value, Fault> {
        match expr {
            Expr::Num(n) => Ok(Value::constant(*n)),
            Expr::Here => Ok(Value {
                value: i128::from(here),
                relocatable: true,
            }),
            Expr::Neg(e) => {
                let v = self.eval_inner(e, here, stack)?;
                Ok(Value {
                    value: v.value.wrapping_neg(),
                    ..v
                })
            }
            Expr::Not(e) => {
                let v = self.eval_inner(e, here, stack)?;
                Ok(Value {
                    value: !v.value,
                    ..v
                })
            }
            Expr::Bin(op, a, b) => {
                let a = self.eval_inner(a, here, stack)?;
                let b = self.eval_inner(b, here, stack)?;
                let value = apply(*op, a.value, b.value)
                    .map_err(|msg| Fault::new(ErrorCode::ExprToken, msg, Span::dummy()))?;
                Ok(Value {
                    value,
                    relocatable: a.relocatable || b.relocatable,
                })
            }
            Expr::Sym(name, span) => self.lookup(name, *span, here, stack),
        }
    }

    fn lookup(
        &mut self,
        name: &str,
        span: Span,
        here: u64,
        stack: &mut Vec<String>,
    ) -> Result<Value, Fault> {
        if self.label_names.contains(name) {
            let addr = self.labels.get(name).copied().unwrap_or(here);
            return Ok(Value {
                value: i128::from(addr),
                relocatable: true,
            });
        }

        if let Some((expr, _)) = self.constants.get(name) {
            if stack.iter().any(|s| s == name) {
                return Err(Fault::new(
                    ErrorCode::DirectiveEqu,
                    format!("cyclic definition of '{}'", name),
                    span,
                ));
            }
            if stack.len() >= self.max_depth {
                return Err(Fault::new(
                    ErrorCode::DirectiveEqu,
                    format!("constant '{}' nests deeper than {}", name, self.max_depth),
                    span,
                ));
            }
            let expr = expr.clone();
            stack.push(String::from(name));
            let value = self.eval_inner(&expr, here, stack);
            stack.pop();
            return value;
        }

        let answer = match self.cache.get(name) {
            Some(cached) => *cached,
            None => {
                let answer = match self.resolver.as_mut() {
                    Some(resolver) => {
                        let answer = resolver.resolve(name);
                        tracing::trace!(symbol = name, ?answer, "symbol resolver called");
                        if answer.is_none() {
                            tracing::warn!(symbol = name, "symbol resolver declined symbol");
                        }
                        answer
                    }
                    None => None,
                };
                self.cache.insert(String::from(name), answer);
                answer
            }
        };
        match answer {
            // Resolver values are 64-bit patterns; treat them as signed.
            Some(v) => Ok(Value::constant(i128::from(v as i64))),
            None => Err(Fault::new(
                ErrorCode::SymbolMissing,
                format!("cannot resolve symbol '{}'", name),
                span,
            )),
        }
    }
}

fn redefined(name: &str, span: Span) -> Fault {
    Fault::new(
        ErrorCode::SymbolRedefined,
        format!("symbol '{}' is already defined", name),
        span,
    )
}
