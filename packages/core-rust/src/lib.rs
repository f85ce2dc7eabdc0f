//! Switchyard core: structured records, dynamic values, and the execution-scoped
//! context store shared by every dispatcher.

pub mod clock;
pub mod context;
pub mod record;
pub mod types;

pub use clock::{ClockSource, SystemClock};
pub use context::{AttachContext, ContextConfig, ContextError, ContextScope, ContextStore, ErrorContext};
pub use record::{BoxRecord, DynRecord, FieldViolation, Record, ValidationError};
pub use types::{Attributes, Principal, Value};
