//! Binary entry point: loads `config/server.yaml`, binds a UDP socket, and
//! runs an [`EchoApplication`] session per connecting client. Grounded on
//! the teacher's `main` (panic hook, `load_server_options`, socket bind),
//! collapsed to this crate's single-threaded tick loop.

use soe_protocol::protocol::app::SessionParameters;
use soe_protocol::{info, load_server_options, EchoApplication, SocketHandler};
use std::panic;
use std::path::Path;
use std::process;
use std::time::Duration;

fn main() {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        process::exit(1);
    }));

    let config_dir = Path::new("config");
    let server_options =
        load_server_options(config_dir).expect("Unable to read server options");
    server_options.validate();

    let session_params = SessionParameters {
        crc_length: server_options.crc_length,
        is_compression_enabled: server_options.is_compression_enabled,
        udp_length: server_options.udp_length,
        encryption_key: None,
        is_encryption_enabled: false,
    };

    let mut handler = SocketHandler::bind(server_options, move || {
        EchoApplication::new(session_params.clone())
    })
    .expect("couldn't bind to socket");

    info!("Hello, world!");

    loop {
        handler.tick(Duration::from_millis(50));
        if handler.should_stop() {
            break;
        }
    }
}
