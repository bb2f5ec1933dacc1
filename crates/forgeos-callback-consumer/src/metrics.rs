use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, register_int_gauge, IntCounterVec, IntGauge};

pub static CYCLE_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("cycle_events_total", "Cycle events by outcome", &["outcome"]).unwrap()
});

pub static RECEIPTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("receipts_total", "Execution receipts by outcome", &["outcome"]).unwrap()
});

pub static EVENTS_RING_SIZE: Lazy<IntGauge> =
    Lazy::new(|| register_int_gauge!("events_ring_size", "Current size of the recent-events ring buffer").unwrap());

pub fn init() {
    Lazy::force(&CYCLE_EVENTS_TOTAL);
    Lazy::force(&RECEIPTS_TOTAL);
    Lazy::force(&EVENTS_RING_SIZE);
}
