//! Wire protocol for the preloader socket.
//!
//! Messages are length-prefixed frames carrying a JSON payload over a Unix
//! domain stream socket. The same [`codec`] helpers are used by the server
//! and the scheduler-side client.

mod codec;
mod error;
mod request;
mod response;

pub use codec::{FramedSocket, connect, connect_with_timeout, frame, recv_message, send_message};
pub use error::ProtocolError;
pub use request::{JobRequest, Request};
pub use response::{JobOutcome, PreloadedProcessor, Response, StatusReport};
