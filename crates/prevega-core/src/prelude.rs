//! Convenient re-exports for downstream crates.

pub use crate::config::{ExecutorErrorPolicy, OutputMode, PreTransformConfig, SqlDialect};
pub use crate::dag::{
    AggregateExpr, AggregateOp, BinExtent, BinParams, BinSpec, LogicalPlan, SortKey, StackOffset,
    TimeUnitPart, WindowFrame, WindowFunction, WindowOp,
};
pub use crate::error::{Error, Result};
pub use crate::expr::{Expr, RowAccess};
pub use crate::registry::{DatasetBinding, ExternalHandle, Payload, SchemaRegistry};
pub use crate::schema::{DataType, Field, Schema};
pub use crate::types::{Column, Scalar, Table};
pub use crate::warning::{Diagnostics, Warning, WarningKind};
