//! Server configuration (SPEC_FULL §A.3), grounded on the teacher's
//! `ServerOptions`/`load_server_options` (`src/main.rs`): a `serde_yaml`
//! struct with `deny_unknown_fields`, a `validate()` that panics on
//! out-of-range values, loaded from `config/server.yaml`.

use serde::Deserialize;
use std::fs::File;
use std::io::Error;
use std::net::IpAddr;
use std::path::Path;

#[non_exhaustive]
#[derive(Debug)]
pub enum ConfigError {
    Io(Error),
    Deserialize(serde_yaml::Error),
}

impl From<Error> for ConfigError {
    fn from(value: Error) -> Self {
        ConfigError::Io(value)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(value: serde_yaml::Error) -> Self {
        ConfigError::Deserialize(value)
    }
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerOptions {
    pub bind_ip: IpAddr,
    pub port: u16,
    pub application_protocol: String,
    pub udp_length: u32,
    pub crc_length: u8,
    pub is_compression_enabled: bool,
    pub allow_port_remaps: bool,
    pub stop_on_last_session_terminated: bool,
    pub packet_pool_size: usize,
    pub data_ack_window: u16,
    pub max_queued_raw_packets: usize,
    pub max_queued_outgoing_reliable_data_packets: usize,
    pub max_queued_incoming_reliable_data_packets: u16,
    pub heartbeat_after_millis: u64,
    pub inactivity_timeout_millis: u64,
    pub acknowledge_all_data: bool,
    pub max_acknowledge_delay_millis: u64,
    pub ack_wait_millis: u64,
}

impl ServerOptions {
    pub fn validate(&self) {
        if self.crc_length > 4 {
            panic!("crc_length must be between 0 and 4 (inclusive)");
        }

        if self.data_ack_window == 0 {
            panic!("data_ack_window must be at least 1");
        }

        if self.udp_length < 64 {
            panic!("udp_length is too small to carry a session request");
        }
    }
}

pub fn load_server_options(config_dir: &Path) -> Result<ServerOptions, ConfigError> {
    let mut file = File::open(config_dir.join("server.yaml"))?;
    Ok(serde_yaml::from_reader(&mut file)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ServerOptions {
        ServerOptions {
            bind_ip: "0.0.0.0".parse().unwrap(),
            port: 4000,
            application_protocol: "EchoProtocol".to_string(),
            udp_length: 512,
            crc_length: 2,
            is_compression_enabled: true,
            allow_port_remaps: true,
            stop_on_last_session_terminated: false,
            packet_pool_size: 256,
            data_ack_window: 32,
            max_queued_raw_packets: 1024,
            max_queued_outgoing_reliable_data_packets: 256,
            max_queued_incoming_reliable_data_packets: 256,
            heartbeat_after_millis: 5_000,
            inactivity_timeout_millis: 30_000,
            acknowledge_all_data: true,
            max_acknowledge_delay_millis: 0,
            ack_wait_millis: 200,
        }
    }

    #[test]
    fn valid_options_pass() {
        sample().validate();
    }

    #[test]
    #[should_panic]
    fn crc_length_over_four_panics() {
        let mut options = sample();
        options.crc_length = 5;
        options.validate();
    }

    #[test]
    #[should_panic]
    fn zero_data_ack_window_panics() {
        let mut options = sample();
        options.data_ack_window = 0;
        options.validate();
    }
}
