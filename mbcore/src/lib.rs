//! # mbcore
//!
//! Core subsystems of a modem-management daemon: a port probe, a
//! serial-line AT-command engine, and a shared parsed-result registry.
//! Device discovery policy, the outward IPC surface, higher-level modem
//! lifecycle, SMS/SIM/Location data models, and per-vendor behavioral
//! overrides are collaborator concerns and are not implemented here.

pub mod at_parser;
pub mod at_port;
pub mod error;
pub mod probe;
pub mod registry;
pub mod serial;
pub mod udev;
pub mod util;

pub use at_port::AtPort;
pub use error::{Error, Result};
pub use probe::{ProbeField, ProbeTask, ProcessorOutcome, Schedule};
pub use registry::{ResultMap, Value};
pub use serial::{CancelToken, PortFlags, PortKind, PortType, SerialPort};
pub use udev::{KernelDevice, UdevRule, UdevRuleSet};
