use std::collections::{BTreeMap, BTreeSet};

use hostpool_domain::{Op, Query, Value, ValueType};
use serde::Serialize;

/// Which kind of module contributed a parameter declaration. Merge rules
/// differ within a kind (set union) and across kinds (subset/superset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Pipeline,
    Inspector,
    Provisioner,
    Task,
}

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModuleKind::Pipeline => "pipeline",
            ModuleKind::Inspector => "inspector",
            ModuleKind::Provisioner => "provisioner",
            ModuleKind::Task => "task",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParamSource {
    pub kind: ModuleKind,
    pub module: String,
}

/// A permitted query shape for a parameter: a bare value, or one of the
/// comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Bare,
    Eq,
    In,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl From<Op> for OpKind {
    fn from(op: Op) -> OpKind {
        match op {
            Op::Eq => OpKind::Eq,
            Op::In => OpKind::In,
            Op::Lt => OpKind::Lt,
            Op::Lte => OpKind::Lte,
            Op::Gt => OpKind::Gt,
            Op::Gte => OpKind::Gte,
        }
    }
}

/// Default for an absent parameter: a literal, or derived from the rest of
/// the query.
#[derive(Clone)]
pub enum ParamDefault {
    Value(Value),
    Derived(fn(&Query) -> Value),
}

impl ParamDefault {
    pub fn resolve(&self, query: &Query) -> Value {
        match self {
            ParamDefault::Value(v) => v.clone(),
            ParamDefault::Derived(f) => f(query),
        }
    }
}

impl std::fmt::Debug for ParamDefault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamDefault::Value(v) => write!(f, "Value({})", v),
            ParamDefault::Derived(_) => write!(f, "Derived(..)"),
        }
    }
}

/// A declared parameter: its value type, which operators requests may use
/// with it, an optional default, and which modules declared it.
#[derive(Debug, Clone)]
pub struct ParamDescriptor {
    pub value_type: ValueType,
    /// `None` means unchecked (any operator). An explicit set restricts.
    pub ops: Option<BTreeSet<OpKind>>,
    pub default: Option<ParamDefault>,
    pub description: &'static str,
    /// Later declarations overwrite default/description instead of
    /// first-writer-wins.
    pub override_meta: bool,
    pub sources: Vec<ParamSource>,
}

impl ParamDescriptor {
    pub fn new(value_type: ValueType) -> ParamDescriptor {
        ParamDescriptor {
            value_type,
            ops: None,
            default: None,
            description: "",
            override_meta: false,
            sources: Vec::new(),
        }
    }

    pub fn ops<I: IntoIterator<Item = OpKind>>(mut self, ops: I) -> Self {
        self.ops = Some(ops.into_iter().collect());
        self
    }

    pub fn bare_only(self) -> Self {
        self.ops([OpKind::Bare])
    }

    pub fn default_value(mut self, v: impl Into<Value>) -> Self {
        self.default = Some(ParamDefault::Value(v.into()));
        self
    }

    pub fn default_derived(mut self, f: fn(&Query) -> Value) -> Self {
        self.default = Some(ParamDefault::Derived(f));
        self
    }

    pub fn describe(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    pub fn override_meta(mut self) -> Self {
        self.override_meta = true;
        self
    }

    /// Whether a bare (operator-less) value is accepted.
    pub fn allows_bare(&self) -> bool {
        self.ops.as_ref().map_or(true, |ops| ops.contains(&OpKind::Bare))
    }

    pub fn allows_op(&self, op: Op) -> bool {
        self.ops
            .as_ref()
            .map_or(true, |ops| ops.contains(&OpKind::from(op)))
    }
}

pub type ParameterMap = BTreeMap<String, ParamDescriptor>;
