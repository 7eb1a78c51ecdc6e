//! End-to-end session behavior: pump telemetry fan-out, event watermarks,
//! and the direct-sensor publish path.

mod common;

use aps_core::broadcast::DeviceNotification;
use aps_core::device::mock::{MockCgm, MockCgmState, MockPump, MockPumpState};
use aps_core::model::{
    BatteryState, BolusState, Direction, PersistedManagerState, PodStatus, PumpEvent, Trend,
    GLUCOSE_DEVICE_TAG, RESERVOIR_LEVEL_UNKNOWN,
};
use aps_core::storage::{keys, KeyValueStoreExt, PumpHistoryStore};
use chrono::{Duration, TimeZone, Utc};

#[tokio::test]
async fn pump_status_fans_out_battery_and_reservoir() {
    let h = common::spawn_session();
    let mut notifications = h.broadcaster.subscribe();

    let expires = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap();
    let pump = MockPump::with_state(MockPumpState {
        title: "Bedside".into(),
        battery_charge: Some(0.8),
        pod: Some(PodStatus {
            reservoir_level: None,
            expires_at: Some(expires),
        }),
    });
    let controller = pump.controller();
    h.session.set_pump(Some(Box::new(pump))).await.unwrap();
    assert_eq!(*h.session.pump_expires_at().borrow(), Some(expires));

    controller.send_status(BolusState::InProgress).await.unwrap();

    match notifications.recv().await.unwrap() {
        DeviceNotification::BolusInProgress(active) => assert!(active),
        other => panic!("unexpected notification: {other:?}"),
    }
    match notifications.recv().await.unwrap() {
        DeviceNotification::PumpBatteryChanged(battery) => {
            assert_eq!(battery.percent, 80);
            assert_eq!(battery.state, BatteryState::Normal);
            assert!(battery.display);
        }
        other => panic!("unexpected notification: {other:?}"),
    }
    match notifications.recv().await.unwrap() {
        DeviceNotification::PumpReservoirChanged(level) => {
            // Unknown level is reported verbatim as the sentinel, never 0.
            assert_eq!(level, RESERVOIR_LEVEL_UNKNOWN);
        }
        other => panic!("unexpected notification: {other:?}"),
    }

    let stored: f64 = h.key_value.load_as(keys::RESERVOIR).unwrap().unwrap();
    assert_eq!(stored, RESERVOIR_LEVEL_UNKNOWN);
    let battery: aps_core::model::Battery =
        h.key_value.load_as(keys::BATTERY).unwrap().unwrap();
    assert_eq!(battery.percent, 80);
}

#[tokio::test]
async fn reservoir_reading_is_stored_and_acknowledged() {
    let h = common::spawn_session();
    let pump = MockPump::new();
    let controller = pump.controller();
    h.session.set_pump(Some(Box::new(pump))).await.unwrap();

    let at = Utc::now();
    let reading = controller.send_reservoir_reading(42.5, at).await.unwrap();
    assert_eq!(reading.new_value.unit_volume, 42.5);
    assert_eq!(reading.new_value.start_date, at);
    assert!(reading.last_value.is_none());
    assert!(reading.continuous);

    let stored: f64 = h.key_value.load_as(keys::RESERVOIR).unwrap().unwrap();
    assert_eq!(stored, 42.5);
}

#[tokio::test]
async fn pump_events_advance_the_start_date() {
    let h = common::spawn_session();
    let pump = MockPump::new();
    let controller = pump.controller();
    h.session.set_pump(Some(Box::new(pump))).await.unwrap();

    // Never seen an event: look back two hours from now.
    let start = controller.query_events_start_date().await.unwrap();
    let expected = Utc::now() - Duration::hours(2);
    assert!((start - expected).num_seconds().abs() <= 5);

    let t1 = Utc.with_ymd_and_hms(2026, 3, 14, 8, 0, 0).unwrap();
    let t2 = t1 + Duration::minutes(30);
    controller
        .send_events(vec![
            PumpEvent {
                title: "TempBasal".into(),
                date: t2,
            },
            PumpEvent {
                title: "Bolus".into(),
                date: t1,
            },
        ])
        .await
        .unwrap();

    assert_eq!(h.history.events().len(), 2);

    // Subsequent reads start fifteen minutes before the newest event.
    let start = controller.query_events_start_date().await.unwrap();
    assert_eq!(start, t2 - Duration::minutes(15));
    assert_eq!(
        h.session.pump_events_start_date().await.unwrap(),
        t2 - Duration::minutes(15)
    );
}

#[tokio::test]
async fn deactivation_clears_the_pump() {
    let h = common::spawn_session();
    let pump = MockPump::new();
    let controller = pump.controller();
    h.session.set_pump(Some(Box::new(pump))).await.unwrap();

    controller.deactivate().await.unwrap();

    // Deactivation has no acknowledgement; wait for the session to catch up.
    let mut cleared = false;
    for _ in 0..100 {
        if h.session.bolus_progress_reporter().await.unwrap().is_none() {
            cleared = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(cleared, "pump was not cleared after deactivation");
    assert!(h.session.pump_display().borrow().is_none());
    let persisted: Option<PersistedManagerState> =
        h.key_value.load_as(keys::PUMP_MANAGER).unwrap();
    assert!(persisted.is_none());
}

#[tokio::test]
async fn cgm_deletion_clears_the_sensor() {
    let h = common::spawn_session();
    let cgm = MockCgm::new();
    let controller = cgm.controller();
    h.session.set_cgm(Some(Box::new(cgm))).await.unwrap();
    assert!(h.session.has_active_cgm().await.unwrap());

    controller.wants_deletion().await.unwrap();

    // Deletion has no acknowledgement; wait for the session to catch up.
    let mut cleared = false;
    for _ in 0..100 {
        if !h.session.has_active_cgm().await.unwrap() {
            cleared = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(cleared, "cgm was not cleared after deletion request");
    assert!(h.session.cgm_display().borrow().is_none());
    let persisted: Option<PersistedManagerState> =
        h.key_value.load_as(keys::CGM_MANAGER).unwrap();
    assert!(persisted.is_none());
}

#[tokio::test]
async fn cgm_gets_its_credential_prefix_from_settings() {
    let h = common::spawn_session();
    let cgm = MockCgm::new();
    let controller = cgm.controller();
    h.session.set_cgm(Some(Box::new(cgm))).await.unwrap();

    let prefix = controller.query_credential_prefix().await.unwrap();
    assert_eq!(prefix, "aps-core.cgm");
}

#[tokio::test]
async fn direct_sensor_batch_is_sorted_with_trend_on_latest_only() {
    let h = common::spawn_session();
    let mut notifications = h.broadcaster.subscribe();
    let cgm = MockCgm::with_state(MockCgmState {
        title: "Sensor".into(),
        should_sync_to_remote_service: false,
        trend: Some(Trend::Up),
    });
    let controller = cgm.controller();
    h.session.set_cgm(Some(Box::new(cgm))).await.unwrap();

    let t0 = Utc.with_ymd_and_hms(2026, 3, 14, 8, 0, 0).unwrap();
    controller
        .push_readings(vec![
            aps_core::model::RawSensorReading {
                quantity_mgdl: 100.4,
                date: t0,
            },
            aps_core::model::RawSensorReading {
                quantity_mgdl: 105.6,
                date: t0 + Duration::minutes(2),
            },
            aps_core::model::RawSensorReading {
                quantity_mgdl: 101.0,
                date: t0 + Duration::minutes(1),
            },
        ])
        .await
        .unwrap();

    let samples = match notifications.recv().await.unwrap() {
        DeviceNotification::GlucosePublished(samples) => samples,
        other => panic!("unexpected notification: {other:?}"),
    };

    // Newest first, values rounded to whole mg/dL.
    assert_eq!(samples.len(), 3);
    assert_eq!(samples[0].sgv, Some(106));
    assert_eq!(samples[1].sgv, Some(101));
    assert_eq!(samples[2].sgv, Some(100));
    assert_eq!(samples[0].date_string, t0 + Duration::minutes(2));

    // Only the chronological maximum carries a direction.
    assert_eq!(samples[0].direction, Some(Direction::SingleUp));
    assert!(samples[1].direction.is_none());
    assert!(samples[2].direction.is_none());

    for sample in samples.iter() {
        assert_eq!(sample.device, GLUCOSE_DEVICE_TAG);
        assert_eq!(sample.date, sample.date_string.timestamp_millis());
        assert!(!sample.id.is_empty());
    }

    // The same batch is waiting in the slot for the ingestion tick.
    let buffered = h.slot.drain();
    assert_eq!(buffered.len(), 3);
    assert_eq!(buffered[0].sgv, Some(106));
}

#[tokio::test]
async fn cgm_data_start_date_tracks_the_glucose_watermark() {
    let h = common::spawn_session();
    let cgm = MockCgm::new();
    let controller = cgm.controller();
    h.session.set_cgm(Some(Box::new(cgm))).await.unwrap();

    let mark = Utc.with_ymd_and_hms(2026, 3, 14, 7, 0, 0).unwrap();
    h.glucose.set_sync_date(mark);

    assert_eq!(controller.query_data_start_date().await.unwrap(), mark);
    assert_eq!(h.session.cgm_data_start_date().await.unwrap(), mark);
}

#[tokio::test]
async fn opted_in_sensor_batches_are_mirrored_after_local_publish() {
    let remote = std::sync::Arc::new(common::ScriptedRemote::default());
    let h = common::spawn_session_with_remote(remote.clone());
    let cgm = MockCgm::with_state(MockCgmState {
        title: "Sensor".into(),
        should_sync_to_remote_service: true,
        trend: None,
    });
    let controller = cgm.controller();
    h.session.set_cgm(Some(Box::new(cgm))).await.unwrap();

    controller
        .push_readings(vec![aps_core::model::RawSensorReading {
            quantity_mgdl: 118.0,
            date: Utc::now(),
        }])
        .await
        .unwrap();

    // Commands are handled in order, so once any later request completes the
    // batch (including its mirror upload) has been fully processed.
    let mut mirrored = false;
    for _ in 0..100 {
        h.session.has_active_cgm().await.unwrap();
        if !remote.uploaded().is_empty() {
            mirrored = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(mirrored, "batch was never mirrored");
    assert_eq!(remote.uploaded()[0].sgv, Some(118));
    // Local publish preceded the mirror.
    assert_eq!(h.slot.drain().len(), 1);
}

#[tokio::test]
async fn bolus_progress_flows_through_the_reporter() {
    let h = common::spawn_session();
    let pump = MockPump::new();
    let controller = pump.controller();
    h.session.set_pump(Some(Box::new(pump))).await.unwrap();

    let mut reporter = h
        .session
        .bolus_progress_reporter()
        .await
        .unwrap()
        .expect("mock pump provides a reporter");

    controller.report_bolus_progress(1.5, 3.0);
    reporter.changed().await.unwrap();
    let progress = *reporter.borrow();
    assert_eq!(progress.delivered_units, 1.5);
    assert_eq!(progress.total_units, 3.0);
    assert!((progress.percent_complete() - 50.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn pump_error_is_broadcast() {
    let h = common::spawn_session();
    let mut notifications = h.broadcaster.subscribe();
    let pump = MockPump::new();
    let controller = pump.controller();
    h.session.set_pump(Some(Box::new(pump))).await.unwrap();

    controller.fail("no communication").await.unwrap();

    match notifications.recv().await.unwrap() {
        DeviceNotification::PumpError(message) => {
            assert_eq!(message, "no communication")
        }
        other => panic!("unexpected notification: {other:?}"),
    }
}
