//! Shared types, error model, and configuration for the Aspects sinks.
//!
//! This crate is the foundation depended on by all other Aspects crates.
//! It provides:
//! - [`AspectsError`], the unified error type
//! - Opaque keys ([`CourseKey`], [`UsageKey`]) and the warehouse timestamp format
//! - Domain types ([`TreeNode`], [`AnnotatedRecord`], [`CourseSummary`], [`FlatRow`])
//! - Configuration ([`AppConfig`], [`SinkSettings`], config loading)

pub mod config;
pub mod error;
pub mod keys;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ClickHouseConfig, ContentStoreConfig, DispatcherConfig, SinkSettings, SinksConfig,
    config_dir, config_file_path, init_config, load_config, load_config_from, validate_config,
};
pub use error::{AspectsError, Result};
pub use keys::{CourseKey, UsageKey};
pub use types::{
    AnnotatedRecord, BlockSnapshot, BulkInsertOptions, CourseSummary, CourseTree, DumpRun,
    ExternalIdRecord, FieldValue, FlatRow, InsertSummary, TreeNode, UserRetirement,
    WAREHOUSE_TIMESTAMP_FORMAT, block_types, format_warehouse_timestamp,
    parse_warehouse_timestamp,
};
