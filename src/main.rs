use std::process;

use clap::Parser;

use nocturne::logging;
use nocturne::{Config, Flags, WebServer};

fn main() {
    let cfg = Config::from_flags(Flags::parse());

    let sink = match logging::init(&cfg) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("nocturne: {}", e);
            process::exit(1);
        }
    };

    let mut server = match WebServer::new(cfg) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            eprintln!("nocturne: {}", e);
            if let Some(sink) = sink {
                sink.shutdown();
            }
            process::exit(1);
        }
    };

    let code = match server.run() {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "reactor failed");
            eprintln!("nocturne: {}", e);
            1
        }
    };

    if let Some(sink) = sink {
        sink.shutdown();
    }
    process::exit(code);
}
