use chrono::Utc;

/// Unique request id, e.g. `req_1718000000000_1234567890`.
pub fn new_id(prefix: &str) -> String {
    let ts = Utc::now().timestamp_millis();
    let rand: u64 = rand::random();
    format!("{}_{}_{}", prefix, ts, rand)
}

/// Short form for log prefixes: the random tail is dropped.
pub fn short_id(id: &str) -> &str {
    match id.rfind('_') {
        Some(pos) if pos > 0 => &id[..pos],
        _ => id,
    }
}
