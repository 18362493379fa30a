//! Probe Engine: given a candidate port and a caller-supplied command
//! schedule, classifies the port and extracts identifying strings.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use tracing::debug;

use crate::at_port::AtPort;
use crate::error::{Error, Result, SerialError};
use crate::registry::ResultMap;
use crate::serial::{CancelToken, PortFlags, PortType};

/// A committed probe verdict field. `Completed` outputs are merged into
/// the task's accumulated verdicts.
#[derive(Debug, Clone)]
pub enum ProbeField {
    IsAt(bool),
    IsQcdm(bool),
    Vendor(String),
    Product(String),
    Revision(String),
    Tag(String, String),
}

/// What a response processor decided after seeing one command's result.
pub enum ProcessorOutcome {
    Completed(ProbeField),
    Advance,
    Abort(Error),
}

pub type ResponseProcessor =
    Rc<dyn Fn(&str, &std::result::Result<String, Error>) -> ProcessorOutcome>;

pub struct ScheduleEntry {
    pub command: String,
    pub timeout: Duration,
    pub processor: ResponseProcessor,
}

/// An ordered sequence of schedule entries tried until one commits a
/// verdict, all are exhausted, or one aborts.
pub struct Schedule {
    pub entries: Vec<ScheduleEntry>,
}

fn at_probe_processor() -> ResponseProcessor {
    Rc::new(|_cmd, result| match result {
        Ok(_) => ProcessorOutcome::Completed(ProbeField::IsAt(true)),
        Err(Error::Serial(SerialError::ResponseTimeout)) => ProcessorOutcome::Advance,
        Err(Error::Serial(SerialError::ParseFailed)) => ProcessorOutcome::Advance,
        Err(_) => ProcessorOutcome::Completed(ProbeField::IsAt(true)),
    })
}

impl Schedule {
    /// Three consecutive "AT" commands with short timeouts. Classifies AT
    /// on the first clean success or recognized non-timeout, non-parse-
    /// failure error; a bare parse failure on all three attempts leaves
    /// the port unclassified (Not-AT).
    pub fn builtin_at_probe() -> Self {
        let entries = (0..3)
            .map(|_| ScheduleEntry {
                command: "AT".to_string(),
                timeout: Duration::from_secs(3),
                processor: at_probe_processor(),
            })
            .collect();
        Schedule { entries }
    }
}

/// Per-port probing task: runs a schedule against a candidate port and
/// accumulates the classification verdicts.
pub struct ProbeTask {
    port: AtPort,
    schedule: Schedule,
    index: usize,
    verdicts: ResultMap,
    /// Custom tags (udev assignments, plugin-contributed flags), kept in
    /// the same registry type the rest of the core uses for heterogeneous
    /// fields crossing a module boundary, rather than a bespoke map.
    tags: ResultMap,
}

impl ProbeTask {
    pub fn new(port: AtPort, schedule: Schedule) -> Self {
        ProbeTask {
            port,
            schedule,
            index: 0,
            verdicts: ResultMap::new(),
            tags: ResultMap::new(),
        }
    }

    fn apply_field(&mut self, field: ProbeField) {
        match field {
            ProbeField::IsAt(v) => {
                let _ = self.verdicts.add_u8("is_at", v as u8);
            }
            ProbeField::IsQcdm(v) => {
                let _ = self.verdicts.add_u8("is_qcdm", v as u8);
            }
            ProbeField::Vendor(s) => {
                let _ = self.verdicts.add_string("vendor", s);
            }
            ProbeField::Product(s) => {
                let _ = self.verdicts.add_string("product", s);
            }
            ProbeField::Revision(s) => {
                let _ = self.verdicts.add_string("revision", s);
            }
            ProbeField::Tag(name, value) => {
                let _ = self.tags.add_string(&name, value);
            }
        }
    }

    /// Merges evaluated udev-rule assignments into the port's effective
    /// tag set. Later calls (e.g. plugin tags added afterward) override
    /// earlier values for the same name, since `ResultMap` lookups always
    /// return the most recently added binding.
    pub fn merge_udev_tags(&mut self, udev_tags: &HashMap<String, String>) {
        for (k, v) in udev_tags {
            let _ = self.tags.add_string(k, v.clone());
        }
    }

    pub fn add_plugin_tag(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let _ = self.tags.add_string(&name.into(), value.into());
    }

    pub fn tags(&self) -> &ResultMap {
        &self.tags
    }

    pub fn verdicts(&self) -> &ResultMap {
        &self.verdicts
    }

    fn classification(&self) -> PortType {
        match self.verdicts.get_u8("is_at") {
            Ok(1) => PortType::At,
            _ => match self.verdicts.get_u8("is_qcdm") {
                Ok(1) => PortType::Qcdm,
                _ => PortType::Unknown,
            },
        }
    }

    /// Runs the schedule to completion: a positive classification,
    /// exhaustion of all entries (Unknown), or an abort.
    pub async fn run(&mut self, cancel: CancelToken) -> Result<PortType> {
        let device = self.port.serial_port().device();
        while self.index < self.schedule.entries.len() {
            let entry_idx = self.index;
            let command = self.schedule.entries[entry_idx].command.clone();
            let timeout = self.schedule.entries[entry_idx].timeout;
            let processor = self.schedule.entries[entry_idx].processor.clone();

            debug!(device = %device, entry = entry_idx, %command, "probe attempt");

            let result = self
                .port
                .command_full(&command, timeout, false, cancel.clone())
                .await;

            match processor(&command, &result) {
                ProcessorOutcome::Completed(field) => {
                    self.apply_field(field);
                    let classification = self.classification();
                    debug!(device = %device, ?classification, "probe classified");
                    return Ok(classification);
                }
                ProcessorOutcome::Advance => {
                    self.index += 1;
                }
                ProcessorOutcome::Abort(e) => return Err(e),
            }
        }
        debug!(device = %device, "probe schedule exhausted, leaving port unclassified");
        Ok(PortType::Unknown)
    }

    /// Port flags implied purely by the accumulated tags; selection
    /// between competing primary/secondary ports across a modem instance
    /// is the owning collaborator's responsibility.
    pub fn flags_from_tags(&self) -> PortFlags {
        let mut flags = PortFlags::empty();
        if self.tags.get_string("ID_MM_PORT_TYPE_AT_PRIMARY").as_deref() == Ok("1") {
            flags.insert(PortFlags::PRIMARY);
        }
        if self.tags.get_string("ID_MM_PORT_TYPE_AT_SECONDARY").as_deref() == Ok("1") {
            flags.insert(PortFlags::SECONDARY);
        }
        if self.tags.get_string("ID_MM_PORT_TYPE_AT_PPP").as_deref() == Ok("1") {
            flags.insert(PortFlags::PPP);
        }
        if self.tags.get_string("ID_MM_PORT_TYPE_GPS_CONTROL").as_deref() == Ok("1") {
            flags.insert(PortFlags::GPS_CONTROL);
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::SerialPort;

    fn task() -> ProbeTask {
        let at_port = AtPort::from_serial_port(SerialPort::new("/dev/ttyFAKE0", crate::serial::PortKind::Tty));
        ProbeTask::new(at_port, Schedule::builtin_at_probe())
    }

    #[test]
    fn classification_defaults_to_unknown() {
        let t = task();
        assert_eq!(t.classification(), PortType::Unknown);
    }

    #[test]
    fn is_at_field_classifies_at() {
        let mut t = task();
        t.apply_field(ProbeField::IsAt(true));
        assert_eq!(t.classification(), PortType::At);
    }

    #[test]
    fn udev_tags_merge_and_override() {
        let mut t = task();
        let mut udev = HashMap::new();
        udev.insert("ID_MM_PORT_TYPE_AT_PRIMARY".to_string(), "1".to_string());
        t.merge_udev_tags(&udev);
        assert_eq!(t.flags_from_tags(), PortFlags::PRIMARY);
        t.add_plugin_tag("ID_MM_PORT_TYPE_AT_PRIMARY", "0");
        assert_eq!(t.flags_from_tags(), PortFlags::empty());
    }

    #[test]
    fn tags_use_shared_registry() {
        let mut t = task();
        t.apply_field(ProbeField::Tag("ID_MM_PORT_TYPE_AT_PPP".to_string(), "1".to_string()));
        assert_eq!(t.tags().get_string("ID_MM_PORT_TYPE_AT_PPP").unwrap(), "1");
        assert_eq!(t.flags_from_tags(), PortFlags::PPP);
    }
}
