//! End-to-end scenarios driving the serial engine over an in-memory
//! loopback socket pair instead of a real tty, plus cross-module checks
//! for the udev interpreter and the result registry.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use mbcore::serial::{CancelToken, PortKind, SerialPort};
use mbcore::{AtPort, KernelDevice, UdevRule, UdevRuleSet};

fn socketpair() -> (RawFd, RawFd) {
    nix::sys::socket::socketpair(
        nix::sys::socket::AddressFamily::Unix,
        nix::sys::socket::SockType::Stream,
        None,
        nix::sys::socket::SockFlag::empty(),
    )
    .expect("socketpair")
}

fn write_peer(fd: RawFd, bytes: &'static [u8]) {
    nix::unistd::write(fd, bytes).expect("peer write");
}

async fn peer_write_after(fd: RawFd, delay: Duration, bytes: &'static [u8]) {
    tokio::time::sleep(delay).await;
    tokio::task::spawn_blocking(move || write_peer(fd, bytes))
        .await
        .unwrap();
}

fn attached_port() -> (SerialPort, RawFd) {
    let (local, peer) = socketpair();
    let port = SerialPort::new("/dev/ttyFAKE-scenario", PortKind::Tty);
    port.attach_raw_fd_for_test(local);
    (port, peer)
}

/// `SerialPort`'s pump task is spawned with `tokio::task::spawn_local` and
/// needs an active `LocalSet` to run in, just like a real daemon driving
/// the engine from inside one (see `mbcore-cli`'s `main`).
async fn local<F: std::future::Future<Output = ()>>(fut: F) {
    let set = tokio::task::LocalSet::new();
    set.run_until(fut).await;
}

/// Scenario: AT probe classifies the port as AT only on the third attempt,
/// after two silent timeouts.
#[tokio::test(flavor = "current_thread")]
async fn at_probe_succeeds_on_third_attempt() {
    local(async {
        let (port, peer) = attached_port();
        let at_port = AtPort::from_serial_port(port);

        let attempts = Rc::new(RefCell::new(0u32));
        let attempts_for_processor = attempts.clone();
        let processor: mbcore::probe::ResponseProcessor = Rc::new(move |_cmd, result| {
            *attempts_for_processor.borrow_mut() += 1;
            match result {
                Ok(_) => mbcore::probe::ProcessorOutcome::Completed(mbcore::probe::ProbeField::IsAt(true)),
                Err(mbcore::Error::Serial(mbcore::error::SerialError::ResponseTimeout)) => {
                    mbcore::probe::ProcessorOutcome::Advance
                }
                Err(e) => mbcore::probe::ProcessorOutcome::Abort(e.clone()),
            }
        });
        let schedule = mbcore::probe::Schedule {
            entries: (0..3)
                .map(|_| mbcore::probe::ScheduleEntry {
                    command: "AT".to_string(),
                    timeout: Duration::from_millis(150),
                    processor: processor.clone(),
                })
                .collect(),
        };
        let mut task = mbcore::probe::ProbeTask::new(at_port, schedule);

        // The peer never answers the first two attempts, then answers OK.
        let driver = peer_write_after(peer, Duration::from_millis(350), b"\r\nOK\r\n");
        let (classification, _) = tokio::join!(task.run(CancelToken::new()), driver);

        assert_eq!(classification.unwrap(), mbcore::serial::PortType::At);
        assert_eq!(*attempts.borrow(), 3);
    })
    .await;
}

/// Scenario: an unsolicited notification arriving interleaved with a
/// command's response is pulled out of the buffer and routed to its
/// handler rather than confusing the response parser.
#[tokio::test(flavor = "current_thread")]
async fn unsolicited_notification_during_command() {
    local(async {
        let (port, peer) = attached_port();
        port.set_remove_echo(false);
        let at_port = AtPort::from_serial_port(port.clone());

        let seen: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let seen_cb = seen.clone();
        port.add_unsolicited(
            regex::bytes::Regex::new(r"\r\n\+CLCC: [^\r\n]*\r\n").unwrap(),
            move |bytes| {
                seen_cb.borrow_mut().extend_from_slice(bytes);
            },
        );

        let driver = peer_write_after(
            peer,
            Duration::from_millis(30),
            b"\r\n+CLCC: 1,1,0,0,0,\"123456789\",161\r\n\r\nOK\r\n",
        );
        let (result, _) = tokio::join!(
            at_port.command_full("AT+CLCC", Duration::from_millis(500), false, CancelToken::new()),
            driver
        );

        assert_eq!(result.unwrap(), "OK");
        assert_eq!(
            String::from_utf8_lossy(&seen.borrow()),
            "\r\n+CLCC: 1,1,0,0,0,\"123456789\",161\r\n"
        );
    })
    .await;
}

/// Scenario: an unsolicited notification that arrives while no command is
/// outstanding is still dispatched to its handler, rather than sitting in
/// the channel until the next command wrongly treats it as that command's
/// own response. Exercises the pump task's independence from command
/// activity.
#[tokio::test(flavor = "current_thread")]
async fn unsolicited_notification_dispatched_while_port_idle() {
    local(async {
        let (port, peer) = attached_port();
        port.set_remove_echo(false);

        let seen: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let seen_cb = seen.clone();
        port.add_unsolicited(
            regex::bytes::Regex::new(r"\r\n\+CREG: 1\r\n").unwrap(),
            move |bytes| {
                seen_cb.borrow_mut().extend_from_slice(bytes);
            },
        );

        write_peer(peer, b"\r\n+CREG: 1\r\n");
        // No command is ever issued; give the pump task a chance to run.
        for _ in 0..20 {
            tokio::task::yield_now().await;
            if !seen.borrow().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(&*seen.borrow(), b"\r\n+CREG: 1\r\n");
    })
    .await;
}

/// Scenario: the device echoes the command verbatim before its real
/// response; the echo is stripped and never reaches the parser.
#[tokio::test(flavor = "current_thread")]
async fn echo_is_suppressed_before_parsing() {
    local(async {
        let (port, peer) = attached_port();
        port.set_remove_echo(true);
        let at_port = AtPort::from_serial_port(port);

        let driver = peer_write_after(peer, Duration::from_millis(20), b"AT+CGMI\r\r\nQuectel\r\n\r\nOK\r\n");
        let (result, _) = tokio::join!(
            at_port.command_full("AT+CGMI", Duration::from_millis(500), false, CancelToken::new()),
            driver
        );

        assert_eq!(result.unwrap(), "Quectel");
    })
    .await;
}

/// Scenario: a spurious NO CARRIER surfacing during a flash cycle is
/// absorbed rather than propagated, since it is expected fallout of
/// dropping the line.
#[tokio::test(flavor = "current_thread")]
async fn flash_absorbs_spurious_no_carrier() {
    local(async {
        let (port, peer) = attached_port();

        let driver = peer_write_after(peer, Duration::from_millis(10), b"\r\nNO CARRIER\r\n");
        let (result, _) = tokio::join!(port.flash(Duration::from_millis(50), true), driver);

        assert!(result.is_ok());
        assert!(!port.is_connected());
    })
    .await;
}

/// Scenario: bytes written by the device during the flash window (the
/// same spurious NO CARRIER as above) must not leak into the response of
/// the command issued right after flash completes.
#[tokio::test(flavor = "current_thread")]
async fn flash_discards_bytes_before_next_command() {
    local(async {
        let (port, peer) = attached_port();
        port.set_remove_echo(false);
        let at_port = AtPort::from_serial_port(port.clone());

        let driver = peer_write_after(peer, Duration::from_millis(10), b"\r\nNO CARRIER\r\n");
        let (flash_result, _) = tokio::join!(port.flash(Duration::from_millis(50), true), driver);
        assert!(flash_result.is_ok());

        let driver = peer_write_after(peer, Duration::from_millis(20), b"\r\nOK\r\n");
        let (result, _) = tokio::join!(
            at_port.command_full("AT", Duration::from_millis(500), false, CancelToken::new()),
            driver
        );

        assert_eq!(result.unwrap(), "OK");
    })
    .await;
}

/// Scenario: a udev rule set where a jump skips over a property
/// assignment for ports that already classified as AT.
#[test]
fn udev_jump_skips_property_assignment() {
    use mbcore::udev::{MatchCondition, MatchOp, RuleResult};

    let rules = vec![
        UdevRule {
            conditions: vec![MatchCondition {
                parameter: "ID_MM_CANDIDATE".to_string(),
                op: MatchOp::Equal,
                value: "1".to_string(),
            }],
            result: RuleResult::GotoLabel("skip_generic".to_string()),
        },
        UdevRule {
            conditions: vec![],
            result: RuleResult::SetProperty {
                name: "ID_MM_PORT_TYPE_AT_PRIMARY".to_string(),
                value: "0".to_string(),
            },
        },
        UdevRule {
            conditions: vec![],
            result: RuleResult::Label("skip_generic".to_string()),
        },
        UdevRule {
            conditions: vec![MatchCondition {
                parameter: "ID_MM_CANDIDATE".to_string(),
                op: MatchOp::Equal,
                value: "1".to_string(),
            }],
            result: RuleResult::SetProperty {
                name: "ID_MM_PORT_TYPE_AT_PRIMARY".to_string(),
                value: "1".to_string(),
            },
        },
    ];
    let set = UdevRuleSet::from_rules(rules).unwrap();

    struct FakeDevice(HashMap<String, String>);
    impl KernelDevice for FakeDevice {
        fn property(&self, name: &str) -> Option<String> {
            self.0.get(name).cloned()
        }
    }
    let mut props = HashMap::new();
    props.insert("ID_MM_CANDIDATE".to_string(), "1".to_string());
    let device = FakeDevice(props);

    let evaluated = set.evaluate(&device);
    assert_eq!(
        evaluated.get("ID_MM_PORT_TYPE_AT_PRIMARY").map(String::as_str),
        Some("1")
    );
}

/// Scenario: asking the result registry for a value under the wrong type
/// returns a type-mismatch error without disturbing the stored value.
#[test]
fn registry_type_mismatch_leaves_value_intact() {
    let verdicts = mbcore::ResultMap::new();
    verdicts.add_u32("signal_quality", 23).unwrap();

    assert!(verdicts.get_string("signal_quality").is_err());
    assert_eq!(verdicts.get_u32("signal_quality").unwrap(), 23);
}
