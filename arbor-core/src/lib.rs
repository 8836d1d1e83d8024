//! # arbor-core
//!
//! Hierarchical tree-automaton engine for arbor.
//!
//! This crate provides:
//! - Content arena of nodes, transitions, conditions and actions
//! - Persistent path identity with name-based healing
//! - Two-phase serialization of node trees and instances
//! - Path queries over the transition graph
//! - The multi-instance controller and its event bus

pub mod action;
pub mod backend;
pub mod condition;
pub mod content;
pub mod context;
pub mod controller;
pub mod document;
pub mod error;
pub mod events;
pub mod guard;
pub mod identity;
pub mod instance;
pub mod node;
pub mod pathfinder;
pub mod registry;
pub mod serializer;
pub mod value;

pub use action::{Action, ActionError, ActionExtension, ActionKind, LogLevel};
pub use backend::{MemoryBackend, SaveBackend};
pub use condition::{Condition, ConditionExtension, ConditionKind};
pub use content::Content;
pub use context::{Context, Scope};
pub use controller::{Controller, ControllerConfig, SharedController};
pub use document::{Limits, NodeRecord, SaveDocument, DOCUMENT_VERSION};
pub use error::CoreError;
pub use events::{AutomatonEvent, EventBus, EventFilter, EventKind, EventRecord, Subscription};
pub use guard::GuardExpr;
pub use identity::Resolution;
pub use instance::{ActionInfo, ActionStatus, Instance, Step};
pub use node::{Node, NodeId, NodeKind, Transition};
pub use pathfinder::{Path, PathStep};
pub use registry::VariantRegistry;
pub use value::{CompareOp, Value, VarTable};
