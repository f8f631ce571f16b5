//! Simulated Firmata board for integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use firmlink_core::config::EngineConfig;
use firmlink_core::engine::Engine;
use firmlink_core::protocol::commands::*;
use firmlink_core::protocol::SysexBuilder;
use firmlink_core::transport::LoopbackTransport;
use tracing_subscriber::EnvFilter;

/// Route library logs to the test output; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Capability report and analog mapping for `pins` pins. Every pin does
/// input, output and pull-up; pins from `analog_from` on are also analog
/// inputs, numbered from channel 0.
pub fn discovery_reports(pins: usize, analog_from: usize) -> (Vec<u8>, Vec<u8>) {
    let mut capability = Vec::new();
    let mut mapping = Vec::new();
    for pin in 0..pins {
        capability.extend_from_slice(&[0x00, 1, 0x01, 1, 0x0B, 1]);
        if pin >= analog_from {
            capability.extend_from_slice(&[0x02, 10]);
            mapping.push((pin - analog_from) as u8);
        } else {
            capability.extend_from_slice(&[0x03, 8]);
            mapping.push(0x7F);
        }
        capability.push(CAPABILITY_END);
    }
    (capability, mapping)
}

/// Make `transport` answer discovery queries like a real board
pub fn attach_board(transport: &LoopbackTransport, pins: usize, analog_from: usize) {
    let (capability, mapping) = discovery_reports(pins, analog_from);
    transport.set_responder(Box::new(move |written| {
        let reply = match written {
            [START_SYSEX, REPORT_FIRMWARE, END_SYSEX] => SysexBuilder::new(REPORT_FIRMWARE)
                .bytes(&[2, 5, b'S', 0, b'i', 0, b'm', 0])
                .build(),
            [START_SYSEX, ANALOG_MAPPING_QUERY, END_SYSEX] => {
                SysexBuilder::new(ANALOG_MAPPING_RESPONSE).bytes(&mapping).build()
            }
            [START_SYSEX, CAPABILITY_QUERY, END_SYSEX] => {
                SysexBuilder::new(CAPABILITY_RESPONSE).bytes(&capability).build()
            }
            _ => return None,
        };
        Some(reply)
    }));
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        reset_delay: Duration::from_millis(10),
        ..EngineConfig::default()
    }
}

/// Engine that finished discovery on a simulated 20-pin board with analog
/// channels on pins 14..20. Discovery traffic is already drained.
pub async fn ready_engine() -> (Arc<Engine>, Arc<LoopbackTransport>) {
    init_tracing();
    let engine = Engine::new(fast_config());
    let transport = Arc::new(LoopbackTransport::new("sim0"));
    attach_board(&transport, 20, 14);
    engine
        .assign_port(transport.clone())
        .await
        .expect("discovery on simulated board");
    transport.take_outbound();
    (engine, transport)
}
