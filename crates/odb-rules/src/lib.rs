//! Consensus rules for OpenDB.
//!
//! This crate decides what the chain accepts. It provides:
//! - Operation hashing and signing, block hashing and merkle roots
//! - Signature checks against `sys.signup` and `sys.login` key objects
//! - Role closure over `sys.role` and grant checks over `sys.grant`
//! - The `sys.validate` expression language and rule evaluation
//! - A closed error taxonomy reported through a [`ValidationListener`]
//!
//! The chain itself is reached only through the [`ChainView`] trait.

pub mod config;
pub mod ctx;
pub mod error;
pub mod expr;
pub mod listener;
pub mod names;
pub mod roles;
pub mod rules;
pub mod user;
pub mod view;

pub use config::{RulesConfig, MAX_BLOCK_SIZE};
pub use ctx::LocalValidationCtx;
pub use error::{ErrorKind, RulesError, ValidationError};
pub use expr::{EvalContext, Expr, ExprError, ExprValue, SignerRoles};
pub use listener::{TracingListener, ValidationListener};
pub use roles::RoleClosure;
pub use rules::{CompiledRule, OpBlockchainRules, ValidationRules};
pub use view::{ChainView, ObjectsSearchRequest};
