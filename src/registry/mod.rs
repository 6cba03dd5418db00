//! Operator registration with a host framework.
//!
//! A host that wants to expose the kernels supplies an [`OperatorTable`]
//! (its operator library) and calls [`register_operators`], which defines
//! `tiledcuda::gemm` and `tiledcuda::scatter_nd`. Calls are later routed
//! through [`ops::dispatch`](crate::ops::dispatch).
//!
//! [`OperatorSet`] is an in-memory table for hosts without their own.

pub mod hardware;

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{KernelError, Result};

/// Namespace the operators are registered under.
pub const NAMESPACE: &str = "tiledcuda";

/// The operators this crate provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperatorKind {
    Gemm,
    ScatterNd,
}

impl OperatorKind {
    pub const ALL: [OperatorKind; 2] = [OperatorKind::Gemm, OperatorKind::ScatterNd];

    /// Unqualified operator name.
    pub fn name(&self) -> &'static str {
        match self {
            OperatorKind::Gemm => "gemm",
            OperatorKind::ScatterNd => "scatter_nd",
        }
    }

    /// `namespace::name`.
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", NAMESPACE, self.name())
    }

    /// Argument signature shown to hosts.
    pub fn schema(&self) -> &'static str {
        match self {
            OperatorKind::Gemm => "gemm(Tensor a, Tensor b) -> Tensor",
            OperatorKind::ScatterNd => {
                "scatter_nd(Tensor(a!) dest, Tensor indices, Tensor updates, str mode) -> ()"
            }
        }
    }
}

/// Operator definition capability supplied by the host.
pub trait OperatorTable {
    /// Define `namespace::name`. Fails with `DuplicateOperator` if the name is
    /// already defined.
    fn define(&mut self, namespace: &str, kind: OperatorKind) -> Result<()>;
}

/// Define every operator of this crate in `table`, once each.
pub fn register_operators(table: &mut dyn OperatorTable) -> Result<()> {
    for kind in OperatorKind::ALL {
        table.define(NAMESPACE, kind)?;
        debug!(op = %kind.qualified_name(), "Registered operator");
    }
    Ok(())
}

/// In-memory operator table keyed by qualified name.
#[derive(Debug, Default)]
pub struct OperatorSet {
    ops: BTreeMap<String, OperatorKind>,
}

impl OperatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a qualified name such as `"tiledcuda::gemm"`.
    pub fn resolve(&self, qualified: &str) -> Option<OperatorKind> {
        self.ops.get(qualified).copied()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Qualified names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ops.keys().map(String::as_str)
    }
}

impl OperatorTable for OperatorSet {
    fn define(&mut self, namespace: &str, kind: OperatorKind) -> Result<()> {
        let qualified = format!("{}::{}", namespace, kind.name());
        if self.ops.contains_key(&qualified) {
            return Err(KernelError::DuplicateOperator(qualified));
        }
        self.ops.insert(qualified, kind);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_defines_both_operators() {
        let mut set = OperatorSet::new();
        register_operators(&mut set).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.resolve("tiledcuda::gemm"), Some(OperatorKind::Gemm));
        assert_eq!(set.resolve("tiledcuda::scatter_nd"), Some(OperatorKind::ScatterNd));
        assert_eq!(set.resolve("gemm"), None);
        assert_eq!(
            set.names().collect::<Vec<_>>(),
            vec!["tiledcuda::gemm", "tiledcuda::scatter_nd"]
        );
    }

    #[test]
    fn test_register_twice_is_duplicate() {
        let mut set = OperatorSet::new();
        register_operators(&mut set).unwrap();
        match register_operators(&mut set) {
            Err(KernelError::DuplicateOperator(name)) => assert_eq!(name, "tiledcuda::gemm"),
            other => panic!("expected DuplicateOperator, got {:?}", other),
        }
    }

    #[test]
    fn test_host_table_sees_namespace() {
        struct Recorder(Vec<String>);
        impl OperatorTable for Recorder {
            fn define(&mut self, namespace: &str, kind: OperatorKind) -> Result<()> {
                self.0.push(format!("{}/{}", namespace, kind.schema()));
                Ok(())
            }
        }
        let mut rec = Recorder(Vec::new());
        register_operators(&mut rec).unwrap();
        assert_eq!(rec.0.len(), 2);
        assert!(rec.0[0].starts_with("tiledcuda/gemm("));
        assert!(rec.0[1].starts_with("tiledcuda/scatter_nd("));
    }
}
