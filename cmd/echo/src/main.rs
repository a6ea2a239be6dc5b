//! TCP echo server demo.
//!
//! ```text
//! ECHO_PORT=12345 ECHO_WORKERS=4 strand-echo
//! printf 'hello' | nc 127.0.0.1 12345
//! ```

use log::{error, info};
use strand::{net, IoManager};
use strand_core::env::env_get;

fn main() {
    env_logger::init();

    let workers: usize = env_get("ECHO_WORKERS", 2);
    let port: u16 = env_get("ECHO_PORT", 12345);

    let iom = IoManager::new(workers, false, "echo").expect("reactor startup failed");
    iom.schedule(move || accept_loop(port));
    info!("echo server on port {} with {} workers", port, workers);

    loop {
        std::thread::park();
    }
}

fn accept_loop(port: u16) {
    let addr = format!("0.0.0.0:{}", port).parse().unwrap();
    let listener = match net::TcpListener::bind(addr) {
        Ok(l) => l,
        Err(e) => {
            error!("bind {} failed: {}", addr, e);
            return;
        }
    };

    loop {
        match listener.accept() {
            Ok(stream) => strand::spawn(move || echo(stream)),
            Err(e) => {
                error!("accept failed: {}", e);
                return;
            }
        }
    }
}

fn echo(stream: net::TcpStream) {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => {
                if stream.write_all(&buf[..n]).is_err() {
                    return;
                }
            }
            Err(e) => {
                error!("read failed: {}", e);
                return;
            }
        }
    }
}
