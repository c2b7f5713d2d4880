//! AWL CPU engine - Common Types and Errors
//!
//! This crate contains the error taxonomy, source locations and block
//! descriptors shared by the engine and its surrounding tooling.

pub mod blockinfo;
pub mod error;
pub mod source_loc;

pub use blockinfo::{BlockInfo, BlockKind};
pub use error::{AwlError, AwlResult, ErrorContext, MaintenanceRequest};
pub use source_loc::{SourceId, SourceLocation};
