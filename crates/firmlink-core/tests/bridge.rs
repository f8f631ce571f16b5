//! End-to-end: supervisor, discovery and failover through the bridge

mod common;

use std::sync::Arc;
use std::time::Duration;

use firmlink_core::bridge::Bridge;
use firmlink_core::config::BridgeConfig;
use firmlink_core::protocol::PinMode;
use firmlink_core::transport::{
    LoopbackOpener, PortStatus, ProbeOutcome, ProbeResult, Prober, Transport, TransportManager,
};
use tokio::sync::watch;
use tokio::time::timeout;

struct AlwaysProber;

impl Prober for AlwaysProber {
    fn probe(&self, _name: &str, _baud_rate: u32) -> Result<(), String> {
        Ok(())
    }
}

fn config() -> BridgeConfig {
    BridgeConfig {
        reset_delay_ms: 10,
        firmware_timeout_ms: 200,
        analog_map_timeout_ms: 200,
        probe_cycle_ms: 20,
        reconnect_poll_ms: 10,
        supervisor_poll_ms: 10,
        ..BridgeConfig::default()
    }
}

/// Candidates "silent" (never answers) then "good" (a simulated board)
fn bridge() -> (Bridge, Arc<LoopbackOpener>) {
    common::init_tracing();
    let opener = Arc::new(LoopbackOpener::with_setup(|t| {
        if t.name() == "good" {
            common::attach_board(t, 20, 14);
        }
    }));
    let config = config();
    let manager = TransportManager::with_candidates(
        &config,
        vec!["silent".to_string(), "good".to_string()],
        opener.clone(),
        Arc::new(AlwaysProber),
    )
    .unwrap();
    for name in ["silent", "good"] {
        manager.apply_probe_result(ProbeResult {
            name: name.to_string(),
            outcome: ProbeOutcome::Available,
            duration: Duration::from_millis(1),
        });
    }
    (Bridge::with_parts(&config, manager), opener)
}

async fn wait_for(status: &mut watch::Receiver<PortStatus>, port: &str) {
    let wanted = PortStatus {
        port: Some(port.to_string()),
        healthy: true,
    };
    timeout(Duration::from_secs(10), async {
        while *status.borrow_and_update() != wanted {
            status.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never became healthy", port));
}

#[tokio::test]
async fn test_fails_over_from_silent_port() {
    let (bridge, opener) = bridge();
    let mut status = bridge.status();
    bridge.start();

    wait_for(&mut status, "good").await;
    // Opening alone already reports healthy; discovery finishes later
    timeout(Duration::from_secs(5), async {
        while !bridge.engine().is_ready() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(bridge.engine().port_name().as_deref(), Some("good"));
    let silent = bridge
        .manager()
        .candidates()
        .into_iter()
        .find(|c| c.name == "silent")
        .unwrap();
    assert!(silent.had_error);
    assert!(!opener.transport("silent").unwrap().is_open());

    bridge.shutdown();
}

#[tokio::test]
async fn test_scheduler_delivers_changes() {
    let (bridge, opener) = bridge();
    let mut status = bridge.status();
    bridge.start();
    wait_for(&mut status, "good").await;
    timeout(Duration::from_secs(5), async {
        while !bridge.engine().is_ready() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let transport = opener.transport("good").unwrap();
    transport.take_outbound();
    bridge.engine().set_pin_mode(13, PinMode::Output, None).unwrap();
    bridge.engine().digital_write(13, 1).unwrap();

    let written = timeout(Duration::from_secs(5), async {
        let mut seen = Vec::new();
        loop {
            seen.extend(transport.take_outbound());
            if seen.windows(3).any(|w| w == [0x91, 0x20, 0x00]) {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("scheduler never flushed");
    assert!(written.windows(3).any(|w| w == [0xF4, 13, 1]));

    bridge.shutdown();
    assert_eq!(bridge.engine().port_name(), None);
}

#[tokio::test]
async fn test_select_port_opens_named_device() {
    let (bridge, _) = bridge();
    assert!(bridge.select_port("good").await.unwrap());
    assert_eq!(bridge.manager().current_name().as_deref(), Some("good"));
}
