//! Message routing from `msg_id` to handler.

pub mod router;

pub use router::{Access, Handler, HandlerContext, HandlerError, HandlerResult, Route, Router};
