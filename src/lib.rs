#![doc = include_str!("../README.md")]
#![warn(rustdoc::broken_intra_doc_links)]
pub mod client;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod hl7;
pub mod listener;
pub mod proxy;
pub mod queue;
pub mod session;

pub use codec::MllpCodec;
pub use config::{Hl7Settings, Mode, ProxyDirection};
pub use error::{BridgeError, Result};
pub use listener::{ListenerHandle, MllpListener};
pub use proxy::{Bridge, BridgeHandle};
