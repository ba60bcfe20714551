//! Integration tests for the acquisition coordinator on mock hardware.

use plasma_daq::config::Settings;
use plasma_daq::coordinator::{Coordinator, PlotUpdate};
use plasma_daq::device::{Severity, SystemClock};
use plasma_daq::hal::{HalCall, Level, MockHal};
use plasma_daq::pid::PidTunings;
use plasma_daq::DaqError;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const TRIGGER_PIN: u8 = 17;

fn create_test_config(data_dir: &Path) -> Settings {
    let toml_str = r#"
        [application]
        name = "Coordinator test"
        log_level = "debug"

        [acquisition]
        sampling_interval_s = 0.05
        title = "Test run"

        [trigger]
        gpio = 17

        [[devices]]
        kind = "adc"
        name = "adc"
        preset_columns = ["MFC1"]
        channels = [
            { name = "Pu", channel = 0, conversion = "ionization_gauge" },
            { name = "Ip", channel = 1, conversion = "hall_sensor" },
            { name = "Pd", channel = 2, conversion = "baratron", full_scale = 0.1 },
        ]
        pid = { kp = 100.0, ki = 1000.0, measured_channel = "Ip", actuator = "dac", actuator_channel = 2 }

        [[devices]]
        kind = "actuator"
        name = "dac"
        channels = [{ name = "MFC1", channel = 0 }, { name = "Cathode", channel = 1 }]
    "#;
    let mut settings: Settings = toml::from_str(toml_str).expect("Failed to parse test config");
    settings.acquisition.data_dir = data_dir.to_path_buf();
    settings
}

fn create_hal() -> Arc<MockHal> {
    let hal = Arc::new(MockHal::new());
    hal.set_input(0, 2.0);
    hal.set_input(2, 1.0);
    // 1 V on the cathode supply reads back as 1 A
    hal.loopback(1, 1, 0.2, 2.52);
    hal
}

fn coordinator(data_dir: &Path, hal: &Arc<MockHal>) -> Coordinator {
    Coordinator::new(create_test_config(data_dir), hal.clone(), Arc::new(SystemClock))
}

#[test]
fn test_setters_before_start_are_noops() {
    let dir = tempfile::tempdir().unwrap();
    let hal = create_hal();
    let coordinator = coordinator(dir.path(), &hal);

    coordinator.set_sampling_interval(1.0);
    coordinator.set_gauge_mode(1);
    coordinator.set_gauge_range(-6);
    coordinator.set_gain("adc", "Ip", 5).unwrap();
    coordinator.set_preset("dac", 1, 1000.0).unwrap();
    coordinator.set_current_setpoint(0.5);
    coordinator.set_pid_tunings("adc", PidTunings::new(1.0, 0.0, 0.0)).unwrap();
    coordinator.capture_zero();
    coordinator.set_temperature(80.0);
    coordinator.start_calibration("dac", 1000.0, 2, 0.0).unwrap();
    coordinator.stop_calibration("dac").unwrap();
    coordinator.stop_outputs();
    coordinator.set_trigger(true);

    assert!(!coordinator.is_running());
    assert!(hal.calls().is_empty());
}

#[test]
fn test_abort_without_session_is_ok() {
    let dir = tempfile::tempdir().unwrap();
    let hal = create_hal();
    let mut coordinator = coordinator(dir.path(), &hal);
    coordinator.abort_acquisition().unwrap();
    coordinator.abort_acquisition().unwrap();
}

#[test]
fn test_second_start_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let hal = create_hal();
    let mut coordinator = coordinator(dir.path(), &hal);

    coordinator.start_acquisition().unwrap();
    assert!(matches!(
        coordinator.start_acquisition(),
        Err(DaqError::AcquisitionRunning)
    ));
    coordinator.abort_acquisition().unwrap();
    assert!(!coordinator.is_running());
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let hal = create_hal();
    let mut settings = create_test_config(dir.path());
    settings.acquisition.sampling_interval_s = -1.0;
    let mut coordinator = Coordinator::new(settings, hal, Arc::new(SystemClock));
    assert!(matches!(
        coordinator.start_acquisition(),
        Err(DaqError::Configuration(_))
    ));
    assert!(!coordinator.is_running());
}

#[test]
fn test_unknown_device_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let hal = create_hal();
    let mut coordinator = coordinator(dir.path(), &hal);
    coordinator.start_acquisition().unwrap();

    assert!(matches!(
        coordinator.set_gain("nope", "Ip", 5),
        Err(DaqError::DeviceNotFound(_))
    ));
    coordinator.abort_acquisition().unwrap();
}

#[test]
fn test_batches_reach_csv_and_plot() {
    let dir = tempfile::tempdir().unwrap();
    let hal = create_hal();
    let (plot_tx, mut plot_rx) = mpsc::unbounded_channel::<PlotUpdate>();
    let mut coordinator = coordinator(dir.path(), &hal).with_plot_sink(plot_tx);

    coordinator.start_acquisition().unwrap();
    let path = coordinator.csv_path("adc").expect("ADC has a CSV file");
    assert!(coordinator.csv_path("dac").is_none());

    coordinator.run_for(Duration::from_millis(500)).unwrap();
    let buffered = coordinator.buffered_rows("adc");
    assert!(buffered > 0);
    coordinator.abort_acquisition().unwrap();

    let update = plot_rx.try_recv().expect("at least one plot update");
    assert_eq!(update.device, "adc");
    let names: Vec<_> = update.series.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["Pu_c", "Ip_c", "Pd_c"]);
    assert!(update.series.iter().all(|s| s.values.len() == update.elapsed.len()));

    let text = std::fs::read_to_string(&path).unwrap();
    let file_name = path.file_name().unwrap().to_string_lossy().to_string();
    assert!(file_name.starts_with("cu_"));
    assert!(file_name.ends_with("_adc.csv"));
    assert!(text.starts_with("# Title , Test run"));
    assert!(text.contains("# Columns , date, time, IGmode, IGrange, trigger, MFC1, Pu, Ip, Pd, Pu_c, Ip_c, Pd_c"));
    assert!(text.contains("# [Data]"));

    let rows: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
    assert!(rows.len() >= buffered);
    for row in rows {
        assert_eq!(row.split(',').count(), 12, "{row}");
    }
}

#[test]
fn test_current_loop_drives_actuator() {
    let dir = tempfile::tempdir().unwrap();
    let hal = create_hal();
    let mut coordinator = coordinator(dir.path(), &hal);

    coordinator.start_acquisition().unwrap();
    coordinator.set_current_setpoint(0.5);
    coordinator.run_for(Duration::from_millis(1200)).unwrap();

    let cathode = hal.output(1).unwrap_or(0.0);
    assert!(cathode > 0.0, "cathode output {cathode}");
    assert!(cathode <= 5.0);

    coordinator.set_current_setpoint(0.0);
    coordinator.run_for(Duration::from_millis(300)).unwrap();
    assert_eq!(hal.output(1), Some(0.0));

    coordinator.abort_acquisition().unwrap();
}

#[test]
fn test_preset_mirrored_and_zero_captured() {
    let dir = tempfile::tempdir().unwrap();
    let hal = create_hal();
    let mut coordinator = coordinator(dir.path(), &hal);

    coordinator.start_acquisition().unwrap();
    coordinator.set_preset("dac", 1, 1200.0).unwrap();
    coordinator.run_for(Duration::from_millis(400)).unwrap();
    assert_eq!(coordinator.preset("MFC1"), Some(1200.0));
    assert_eq!(hal.output(0), Some(1.2));

    coordinator.capture_zero();
    coordinator.run_for(Duration::from_millis(300)).unwrap();
    let offset = coordinator.zero_offset("Ip").expect("zero captured");
    assert!(offset.abs() < 1e-9, "offset {offset}");

    coordinator.abort_acquisition().unwrap();
}

#[test]
fn test_calibration_sweep_through_coordinator() {
    let dir = tempfile::tempdir().unwrap();
    let hal = create_hal();
    let mut coordinator = coordinator(dir.path(), &hal);

    coordinator.start_acquisition().unwrap();
    coordinator.run_for(Duration::from_millis(100)).unwrap();
    hal.clear_calls();

    coordinator.start_calibration("dac", 1000.0, 2, 0.02).unwrap();
    coordinator.run_for(Duration::from_millis(2000)).unwrap();

    assert_eq!(hal.writes_to(0), vec![0.0, 0.5, 1.0, 0.5, 0.0]);
    let finished = coordinator
        .messages()
        .entries()
        .iter()
        .any(|e| e.message == "Calibration finished");
    assert!(finished);
    // indicator pattern, then released by the finished sweep
    assert_eq!(hal.pin(TRIGGER_PIN), Some(Level::Low));

    coordinator.abort_acquisition().unwrap();
}

#[test]
fn test_abort_zeroes_actuators_before_trigger_release() {
    let dir = tempfile::tempdir().unwrap();
    let hal = create_hal();
    // A DAC that failed to initialise stays silent, so every write seen during
    // the abort is the coordinator's own zeroing.
    hal.fail_outputs(0, true);
    let mut coordinator = coordinator(dir.path(), &hal);

    coordinator.start_acquisition().unwrap();
    coordinator.set_trigger(true);
    coordinator.run_for(Duration::from_millis(300)).unwrap();
    assert_eq!(hal.pin(TRIGGER_PIN), Some(Level::High));
    assert!(coordinator.messages().count(Severity::Error) > 0);

    hal.fail_outputs(0, false);
    hal.clear_calls();
    coordinator.abort_acquisition().unwrap();

    let calls = hal.calls();
    let writes: Vec<(usize, &HalCall)> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, HalCall::Write { .. }))
        .collect();
    let written: Vec<&HalCall> = writes.iter().map(|(_, c)| *c).collect();
    assert_eq!(
        written,
        vec![
            &HalCall::Write { channel: 0, volts: 0.0 },
            &HalCall::Write { channel: 1, volts: 0.0 },
        ]
    );
    let released = calls
        .iter()
        .position(|c| {
            *c == HalCall::GpioWrite {
                pin: TRIGGER_PIN,
                level: Level::Low,
            }
        })
        .expect("trigger released");
    assert!(writes.iter().all(|(i, _)| *i < released));
    assert_eq!(hal.output(0), Some(0.0));
    assert_eq!(hal.output(1), Some(0.0));
}

#[test]
fn test_abort_during_calibration_dwell_is_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let hal = create_hal();
    let mut coordinator = coordinator(dir.path(), &hal);

    coordinator.start_acquisition().unwrap();
    coordinator.run_for(Duration::from_millis(100)).unwrap();
    coordinator.start_calibration("dac", 1000.0, 2, 3.0).unwrap();
    coordinator.run_for(Duration::from_millis(200)).unwrap();

    let started = Instant::now();
    coordinator.abort_acquisition().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!coordinator.is_running());
    assert_eq!(hal.output(0), Some(0.0));
    assert_eq!(hal.output(1), Some(0.0));
}

#[test]
fn test_drop_aborts_running_session() {
    let dir = tempfile::tempdir().unwrap();
    let hal = create_hal();
    {
        let mut coordinator = coordinator(dir.path(), &hal);
        coordinator.start_acquisition().unwrap();
        coordinator.set_preset("dac", 1, 500.0).unwrap();
        coordinator.run_for(Duration::from_millis(200)).unwrap();
    }
    assert_eq!(hal.output(0), Some(0.0));
    assert_eq!(hal.pin(TRIGGER_PIN), Some(Level::Low));
}
