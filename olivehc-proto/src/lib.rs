//! HTTP wire protocol: request parsing and response rendering, with no
//! knowledge of devices, tenants, or the worker pool.

pub mod request_parse;
pub mod response;

pub use request_parse::{Method, ParseError, ParseOutcome, ParsedRequest, Range};
pub use response::StatusCode;
