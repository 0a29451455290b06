//! File-drop protocol implementation.
//!
//! One exchange per connection: the client sends a header block and a
//! payload, the server answers with a status block and closes.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  filename: <name>\n
//!           filesize: <decimal bytes>\n
//!           \n
//!           <exactly filesize raw bytes>
//!
//! Success:  STATUS: OK\n
//!           MESSAGE: File received successfully\n
//!
//! Failure:  STATUS: NOT OK\n
//!           STATUS CODE: <code>\n
//!           MESSAGE: <message>\n
//!           DETAILS: <details>\n
//! ```
//!
//! Keys are case-insensitive. Any other key, or a line without `:`, is
//! rejected with status 400 before the payload is read.

mod deadline;
pub mod error;
pub mod handler;
pub mod parser;
pub mod payload;

pub use error::ConnError;
pub use handler::{handle_connection, HandlerContext};
