use chrono::Utc;

/// Source of wall clock time in milliseconds since epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

pub fn elapsed_sec(start_ms: i64, now_ms: i64) -> i64 {
    // the clock can go backwards (e.g. the user changed the system time), we
    // just report 0 in that case.
    (now_ms - start_ms).max(0) / 1000
}

// `m:ss`, or `h:mm:ss` once we pass an hour.
pub fn format_duration(sec: i64) -> String {
    let sec = sec.max(0);
    let m = sec / 60;
    let s = sec % 60;
    let h = m / 60;
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m % 60, s)
    } else {
        format!("{m}:{s:02}")
    }
}
