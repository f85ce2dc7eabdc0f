//! Switchyard: typed command dispatch with dependency wiring, middleware and
//! execution-scoped context.
//!
//! A [`Dispatcher`] routes each command record to exactly one handler, either
//! an [`Operation`] or an [`Orchestrator`], through a [`MiddlewarePipeline`].
//!
//! ```
//! use serde::Serialize;
//! use switchyard::{Dispatcher, HandlerContext, Operation, Record};
//!
//! #[derive(Debug, Clone, Serialize)]
//! struct Ping;
//! impl Record for Ping {
//!     const TYPE_NAME: &'static str = "Ping";
//! }
//!
//! #[derive(Debug, Clone, PartialEq, Serialize)]
//! struct Pong {
//!     pong: bool,
//! }
//! impl Record for Pong {
//!     const TYPE_NAME: &'static str = "Pong";
//! }
//!
//! struct PingHandler;
//! impl Operation for PingHandler {
//!     type Command = Ping;
//!     type Output = Pong;
//!     fn execute(&self, _: Ping, _: &HandlerContext) -> anyhow::Result<Pong> {
//!         Ok(Pong { pong: true })
//!     }
//! }
//!
//! let mut dispatcher = Dispatcher::default();
//! dispatcher.register_operation(|_| Ok(PingHandler)).unwrap();
//! assert_eq!(dispatcher.call_as::<Pong>(Ping).unwrap(), Pong { pong: true });
//! ```

pub mod bus;
pub mod config;
pub mod dependency;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod middleware;
pub mod registry;
pub mod service;

pub use bus::{DispatchBus, ErrorHandler, OperationBus};
pub use config::DispatchConfig;
pub use dependency::{Dependencies, DependencyRegistry};
pub use dispatcher::Dispatcher;
pub use error::{Conflict, DispatchError};
pub use handler::{HandlerContext, HandlerKind, Operation, Orchestrator};
pub use middleware::{CallContext, Middleware, MiddlewarePipeline};
pub use registry::HandlerRegistry;
pub use service::DispatchService;
pub use switchyard_core::{
    attributes, AttachContext, Attributes, BoxRecord, ContextConfig, ContextError, ContextScope, ContextStore,
    DynRecord, ErrorContext, Principal, Record, ValidationError, Value,
};
