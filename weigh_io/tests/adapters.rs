use rstest::rstest;
use weigh_config::{Parity, PrintSection, SerialSection};
use weigh_io::{CommandPrinter, IoError, SerialOpener, pick_port};
use weigh_traits::{Printer, TransportOpener};

fn printer(command: &str, args: &[&str]) -> CommandPrinter {
    CommandPrinter::from_section(&PrintSection {
        command: command.into(),
        args: args.iter().map(|s| s.to_string()).collect(),
        ..PrintSection::default()
    })
}

#[rstest]
#[case(None, vec!["/tmp/x.pdf"])]
#[case(Some("dock-2"), vec!["-d", "dock-2", "/tmp/x.pdf"])]
fn print_args_follow_template(#[case] name: Option<&str>, #[case] expected: Vec<&str>) {
    let p = printer("lp", &["{file}"]);
    assert_eq!(p.render_args("/tmp/x.pdf", name), expected);
}

#[cfg(unix)]
#[test]
fn print_command_exit_status_decides_outcome() {
    assert!(printer("true", &["{file}"]).print(b"%PDF-1.4", None).is_ok());

    let err = printer("false", &["{file}"]).print(b"%PDF-1.4", None).unwrap_err();
    assert!(matches!(err.downcast_ref::<IoError>(), Some(IoError::PrintCommand(_))));
}

#[test]
fn missing_print_command_is_reported() {
    let err = printer("weigh-no-such-spooler", &["{file}"]).print(b"%PDF", None).unwrap_err();
    assert!(err.to_string().contains("weigh-no-such-spooler"));
}

#[rstest]
#[case(5, 1, true)]
#[case(8, 2, true)]
#[case(9, 1, false)]
#[case(8, 3, false)]
fn serial_line_settings_are_validated(#[case] data_bits: u8, #[case] stop_bits: u8, #[case] ok: bool) {
    let s = SerialSection {
        port: "/dev/ttyUSB0".into(),
        data_bits,
        stop_bits,
        parity: Parity::E,
        ..SerialSection::default()
    };
    let res = SerialOpener::from_section(&s);
    assert_eq!(res.is_ok(), ok);
    if let Ok(o) = res {
        assert!(o.describe().starts_with("/dev/ttyUSB0 @ "));
    }
}

#[rstest]
#[case::windows(&["COM4", "COM3"], Some("COM4"))]
#[case::usb_before_acm(&["/dev/ttyS0", "/dev/ttyACM0", "/dev/ttyUSB1", "/dev/ttyUSB0"], Some("/dev/ttyUSB0"))]
#[case::acm_only(&["/dev/ttyS0", "/dev/ttyACM1", "/dev/ttyACM0"], Some("/dev/ttyACM0"))]
#[case::builtin_uart_is_ignored(&["/dev/ttyS0", "/dev/ttyAMA0"], None)]
#[case::nothing(&[], None)]
fn auto_port_selection(#[case] names: &[&str], #[case] want: Option<&str>) {
    assert_eq!(pick_port(names).as_deref(), want);
}

#[test]
fn auto_port_is_recognized_case_insensitively() {
    for port in ["auto", "AUTO", "Auto"] {
        let s = SerialSection {
            port: port.into(),
            ..SerialSection::default()
        };
        let o = SerialOpener::from_section(&s).expect("valid settings");
        assert!(o.is_auto());
        assert!(o.describe().starts_with(&format!("{port} @ ")));
    }
    let fixed = SerialOpener::from_section(&SerialSection::default()).expect("valid settings");
    assert!(!fixed.is_auto());
}
