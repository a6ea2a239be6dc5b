//! Timer showcase: a recurring tick, a one-shot, and cooperative sleeps
//! inside fibers.

use log::info;
use std::time::Instant;
use strand::{hook, IoManager};

fn main() {
    env_logger::init();

    let iom = IoManager::new(2, false, "timers").expect("reactor startup failed");
    let t0 = Instant::now();

    let tick = iom.add_timer(500, true, move || {
        info!("tick at {:?}", t0.elapsed());
    });
    iom.add_timer(1200, false, move || {
        info!("one-shot at {:?}", t0.elapsed());
    });

    iom.schedule(move || {
        for i in 1..=3 {
            hook::sleep_ms(300);
            info!("fiber slept {} times at {:?}", i, t0.elapsed());
        }
    });

    std::thread::sleep(std::time::Duration::from_millis(2600));

    // recurring timers keep the reactor alive; cancel before stopping
    tick.cancel();
    iom.stop();
    info!("done after {:?}", t0.elapsed());
}
