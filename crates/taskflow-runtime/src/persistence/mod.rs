//! Durable storage: record types and the SQLite repository.

pub mod entities;
pub mod sqlite;

pub use entities::{
    CostEntry, NewCostEntry, NewRun, RunRecord, RunUpdate, StepRecord, TemplateGraph, TemplateNode,
    WorkflowTemplate,
};
pub use sqlite::Repository;

/// Storage-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Constraint violation: {0}")]
    Constraint(String),
    #[error("Persistence error: {0}")]
    Other(String),
}

/// Storage result type.
pub type PersistenceResult<T> = Result<T, PersistenceError>;
