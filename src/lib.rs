pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod subscription;
pub mod transport;
pub mod value;

pub use command::{Command, ToArg};
pub use config::Config;
pub use connection::{Connection, ReplyFuture};
pub use error::{Error, Result};
pub use frame::Frame;
pub use subscription::{PushKind, Sink};
pub use transport::{Network, Transport};
pub use value::{bind, Destination, Value};
