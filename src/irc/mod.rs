//! Line-level IRC layer: message grammar, `\r\n` framing, ISUPPORT tracking.

pub mod codec;
pub mod isupport;
pub mod message;
