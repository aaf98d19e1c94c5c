//! nms-ring-core — severity-alerting pass-through proxy engine.
//!
//! Wraps a third-party interactive console program (the planet probe tool)
//! in a pseudo-terminal, mirrors its output verbatim, forwards operator
//! input on recognized prompts, and coalesces bursts of severity tags into
//! a single highest-grade audible alert per rendering pass.
//!
//! # Components
//! - `level`: the fixed E..SSS severity ladder
//! - `classify`: declarative tag/marker scanner over decoded output
//! - `aggregate`: the debounce window that rings at most once per pass
//! - `session`: child process + PTY (or raw pipe) duplex transport
//! - `ring`: chime synthesis, custom ring override, threshold gate
//! - `proxy`: the controller wiring it all under one shutdown signal

pub mod aggregate;
pub mod classify;
pub mod decode;
pub mod level;
pub mod proxy;
pub mod ring;
pub mod session;
pub mod types;

pub use aggregate::{AggregatorHandle, Notify, WindowEvent};
pub use classify::{Classification, Classifier};
pub use level::Severity;
pub use ring::{RingPlayer, RingSound};
pub use session::{ExitWait, Session};
pub use types::{OutputChunk, ProxyError, ProxyOptions, Transport};
