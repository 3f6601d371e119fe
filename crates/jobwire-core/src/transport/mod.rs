//! Transport for the tracking service.
//!
//! One full-duplex TCP stream per session carrying length-prefixed JSON
//! frames. Nothing in here retries; the supervisor owns reconnection.
//!
//! - **Protocol**: frame encoding shared by the client and test services
//! - **Session**: connect, then split into a receive half and a send half

pub mod protocol;
pub mod session;

pub use protocol::{read_frame, write_frame};
pub use session::{Session, SessionReader, SessionWriter};
