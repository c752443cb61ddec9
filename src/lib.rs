//! Tabula - Embedded Tabular Data Engine
//!
//! Typed, relational tables ("databases") embedded in documents: rows with
//! typed cells, bidirectional relations, read-time formulas, rollups and
//! lookups, plus smart rules that react to row updates.
//!
//! # Architecture
//!
//! - Store Layer: in-memory tables behind one lock, units of work with undo
//!   logs, optional RocksDB durability
//! - Schema Layer: databases and typed columns, relation pairing
//! - Row Layer: cell coercion, edge-set diffs with inverse mirroring,
//!   multi-pass materialization
//! - Formula Layer: lexer, parser and evaluator for column formulas
//! - Query Layer: kind-aware filters and sorting over materialized rows
//! - Rule Layer: ON_ROW_UPDATE automations with a bounded cascade

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

// Store modules
pub mod storage;
pub mod store;
pub mod transaction;

// Schema and rows
pub mod relation;
pub mod row_store;
pub mod schema;

// Formula modules
pub mod formula;
pub mod formula_ast;
pub mod formula_lexer;
pub mod formula_parser;
pub mod rollup;

// Query and rules
pub mod query;
pub mod rules;

// Collaborator surface
pub mod api;
pub mod engine;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use types::{CellRecord, CellValue, ColumnId, DatabaseId, RawValue, RowId, RuleId, Sentinel, Value, ValueType};

// Store exports
pub use storage::StorageEngine;
pub use store::{Store, StoreState};
pub use transaction::{Mutation, Transaction, TransactionId};

// Schema exports
pub use schema::{
    Column, ColumnKind, ColumnSpec, ColumnUpdate, Database, FormulaResultType, InverseSpec,
    InverseUpdate, LookupPolicy, SchemaRegistry,
};
pub use relation::{EdgeSetDiff, RelationEdge, RelationLinker};
pub use row_store::{coerce_raw, MaterializedRow, Row, RowStore, RowValues, UpdateReport};

// Formula exports
pub use formula::{evaluate_formula, CompiledFormula, FormulaError};
pub use formula_parser::{parse_formula, Parser as FormulaParser};
pub use rollup::{aggregate, RollupError, RollupFunction};

// Query exports
pub use query::{Filter, FilterOperator, QueryDiagnostic, QueryEngine, QueryResult, Sort, SortDirection};

// Rule exports
pub use rules::{
    ActionValue, RuleAction, RuleEngine, RuleFilter, RuleRegistry, RuleSpec, RuleTrigger,
    SkipReason, SmartRule, TriggerError, TriggerReport, TriggerType,
};

pub use api::{Request, Response};
pub use engine::TabulaEngine;
