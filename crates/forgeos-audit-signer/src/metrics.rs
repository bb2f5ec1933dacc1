use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

pub static SIGN_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("sign_requests_total", "Audit-sign requests by outcome", &["outcome"]).unwrap()
});

pub static LOG_APPENDS_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| register_int_counter!("log_appends_total", "Audit log records appended").unwrap());

pub fn init() {
    Lazy::force(&SIGN_REQUESTS_TOTAL);
    Lazy::force(&LOG_APPENDS_TOTAL);
}
