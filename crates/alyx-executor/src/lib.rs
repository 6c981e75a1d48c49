//! Polyglot function executor.
//!
//! One-shot subprocess per invocation, JSON on stdin/stdout, stderr captured
//! as logs. Any runtime that honors the wire protocol is supported.

pub mod descriptor;
pub mod error;
pub mod protocol;
pub mod runner;
pub mod token;

pub use descriptor::{FunctionDescriptor, FunctionIndex, Runtime};
pub use error::{ExecutorError, Result};
pub use protocol::{InvokeContext, InvokeRequest, InvokeResponse, WireError};
pub use runner::{Executor, InvokeOutcome, InvokeStatus};
pub use token::TokenVault;
