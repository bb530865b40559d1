//! Operator commands end to end: optimistic edit, remote call against the
//! mock rig service, confirmation or rollback, and the auto-safety disable.

use monitor::Monitor;
use monitor::api::HttpControlApi;
use monitor::config::load_config_from_str;
use monitor::gateway::{CommandError, CommandKind};
use monitor::model::{SettingsPatch, StationCounters, StationId};
use monitor::ui_events::MonitorUiEvent;
use std::sync::Arc;
use std::time::Duration;
use sw_protocol::MachineState;
use sw_test_utils::MockStationServer;

const WAIT: Duration = Duration::from_secs(5);

async fn connected_monitor(server: &MockStationServer) -> Monitor {
    let base_url = server.base_url();
    let config = load_config_from_str(&format!(
        r#"
schema_version = 1

[server]
base_url = "{base_url}"

[reconnect]
delay_ms = 50
"#
    ))
    .expect("config");
    let monitor = Monitor::init(&config, Arc::new(HttpControlApi::new(&base_url).expect("client")));
    monitor.start();
    wait_until(|| monitor.connection_state().data_loaded, "initial data").await;
    wait_until(|| server.live_clients() == 1, "client registered").await;
    monitor
}

async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn sid(n: u8) -> StationId {
    StationId::new(n).unwrap()
}

fn station_routes(server: &MockStationServer, id: u8) -> usize {
    let route = format!("PUT /stations/{id}/state");
    server.commands().iter().filter(|c| c.route == route).count()
}

#[tokio::test]
async fn snapshot_during_unconfirmed_disable_keeps_local_flag() {
    let server = MockStationServer::start().await.unwrap();
    let monitor = connected_monitor(&server).await;
    assert!(monitor.store().station_enabled(sid(2)));

    server.hold_commands();
    let command = tokio::spawn(monitor.gateway().set_station_state(sid(2), false));
    assert!(!monitor.store().station_enabled(sid(2)));
    wait_until(|| server.commands().len() == 1, "command reaches service").await;

    // Service has not applied the disable yet and still reports it enabled.
    let mut stale = server.status();
    stale.stations[1].enabled = true;
    stale.stations[1].motor_failures = 3;
    server.push_status_update(&stale);
    wait_until(
        || monitor.store().system().station(sid(2)).motor_failures == 3,
        "stale snapshot merged",
    )
    .await;
    assert!(!monitor.store().station_enabled(sid(2)));
    assert!(monitor.store().is_pending(sid(2)));

    server.release_commands();
    command.await.unwrap().expect("disable confirmed");
    assert!(!monitor.store().is_pending(sid(2)));
    assert!(!server.status().stations[1].enabled);

    server.push_status();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!monitor.store().station_enabled(sid(2)));
}

#[tokio::test]
async fn failed_timer_reverts_and_reports_detail() {
    let server = MockStationServer::start().await.unwrap();
    let monitor = connected_monitor(&server).await;
    let mut ui = monitor.subscribe_ui();
    assert!(!monitor.store().timer_active());

    server.fail_commands(true);
    let err = monitor.gateway().set_timer(1, 30).unwrap().await.unwrap_err();
    assert!(matches!(err, CommandError::Remote(_)));
    assert!(err.to_string().contains("mock failure"), "{err}");
    assert!(!monitor.store().timer_active());

    let failure = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(MonitorUiEvent::CommandFailed { failure }) = ui.recv().await {
                return failure;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(failure.command, CommandKind::SetTimer);
}

#[tokio::test]
async fn timer_end_time_comes_from_the_next_snapshot() {
    let server = MockStationServer::start().await.unwrap();
    let monitor = connected_monitor(&server).await;

    monitor.gateway().set_timer(0, 10).unwrap().await.unwrap();
    assert!(monitor.store().timer_active());
    assert!(monitor.store().system().timer_end_time.is_none());

    server.push_status();
    wait_until(|| monitor.store().system().timer_end_time.is_some(), "end time").await;
    wait_until(|| !monitor.countdown().is_zero(), "countdown running").await;
    let remaining = monitor.countdown();
    assert_eq!(remaining.hours, 0);
    assert!(remaining.minutes <= 10);

    monitor.gateway().clear_timer().unwrap().await.unwrap();
    server.push_status();
    wait_until(|| monitor.countdown().is_zero(), "countdown cleared").await;
}

#[tokio::test]
async fn toggle_running_round_trips_and_is_refused_when_disabled() {
    let server = MockStationServer::start().await.unwrap();
    let monitor = connected_monitor(&server).await;

    monitor.gateway().toggle_running().unwrap().await.unwrap();
    assert_eq!(monitor.store().machine_state(), MachineState::On);
    assert_eq!(server.status().machine_state, MachineState::On);

    server.update_status(|s| s.machine_state = MachineState::Disabled);
    server.push_status();
    wait_until(
        || monitor.store().machine_state() == MachineState::Disabled,
        "disabled snapshot",
    )
    .await;

    let before = server.commands().len();
    assert!(matches!(
        monitor.gateway().toggle_running(),
        Err(CommandError::MachineDisabled)
    ));
    assert_eq!(server.commands().len(), before);
}

#[tokio::test]
async fn settings_save_sends_merged_bundle() {
    let server = MockStationServer::start().await.unwrap();
    let monitor = connected_monitor(&server).await;

    let patch = SettingsPatch {
        cycles_per_minute: Some(9),
        cutoff_voltage: Some(11.5),
        ..SettingsPatch::default()
    };
    monitor.gateway().save_settings(patch).unwrap().await.unwrap();

    let saved = server.settings();
    assert_eq!(saved.cycles_per_minute, 9);
    assert!((saved.cutoff_voltage - 11.5).abs() < f64::EPSILON);
    assert_eq!(saved.cycle_limit, 100_000);
    assert_eq!(monitor.store().settings(), Some(saved));
}

#[tokio::test]
async fn failed_counter_reset_restores_counters() {
    let server = MockStationServer::start().await.unwrap();
    server.update_status(|s| s.stations[3].current_cycles = 420);
    let monitor = connected_monitor(&server).await;
    let before = monitor.store().station_counters(sid(4));
    assert_eq!(before.current_cycles, 420);

    server.fail_commands(true);
    let zeroed = StationCounters {
        current_cycles: 0,
        motor_failures: 0,
        switch_failures: 0,
    };
    assert!(
        monitor
            .gateway()
            .update_station_settings(sid(4), zeroed)
            .await
            .is_err()
    );
    assert_eq!(monitor.store().station_counters(sid(4)), before);
}

#[tokio::test]
async fn threshold_breach_disables_station_exactly_once() {
    let server = MockStationServer::start().await.unwrap();
    let monitor = connected_monitor(&server).await;

    server.update_status(|s| s.stations[0].motor_failures = 10);
    server.push_status();
    wait_until(|| station_routes(&server, 1) == 1, "auto disable").await;
    wait_until(|| !server.status().stations[0].enabled, "service applied disable").await;
    wait_until(|| !monitor.store().is_pending(sid(1)), "disable confirmed").await;

    for extra in 11..14 {
        server.update_status(|s| s.stations[0].motor_failures = extra);
        server.push_status();
    }
    wait_until(
        || monitor.store().system().station(sid(1)).motor_failures == 13,
        "later snapshots merged",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(station_routes(&server, 1), 1);
    assert!(!monitor.store().station_enabled(sid(1)));
    assert_eq!(station_routes(&server, 2), 0);
}

#[tokio::test]
async fn failing_service_gets_one_auto_disable_per_snapshot() {
    let server = MockStationServer::start().await.unwrap();
    let monitor = connected_monitor(&server).await;
    server.fail_commands(true);

    server.update_status(|s| s.stations[2].switch_failures = 10);
    server.push_status();
    wait_until(|| station_routes(&server, 3) == 1, "auto disable").await;
    wait_until(|| monitor.store().station_enabled(sid(3)), "disable rolled back").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(station_routes(&server, 3), 1);

    server.push_status();
    wait_until(|| station_routes(&server, 3) == 2, "retried on next snapshot").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(station_routes(&server, 3), 2);
}
