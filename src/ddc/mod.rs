//! DDC/CI core I/O engine: packet framing, transport, retry, multi-part
//! transfer, and Dynamic Sleep Adjustment.

pub mod dsa;
pub mod error;
pub mod exchange;
pub mod lock;
pub mod multipart;
pub mod packet;
pub mod retry;
pub mod transport;
