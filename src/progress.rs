use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::sync::Mutex;

const MAX_LOG_LINES: usize = 50;

/// Where an activity line came from; the shell colors by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Info,
    Request,
    Pull,
    Images,
    Error,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub text: String,
    pub kind: Kind,
}

static ACTIVITY_LOG: Lazy<Mutex<VecDeque<Entry>>> = Lazy::new(|| Mutex::new(VecDeque::with_capacity(MAX_LOG_LINES)));

pub fn log<T: Into<String>>(line: T) {
    log_with(Kind::Info, line);
}

pub fn log_with<T: Into<String>>(kind: Kind, line: T) {
    if let Ok(mut buf) = ACTIVITY_LOG.lock() {
        if buf.len() >= MAX_LOG_LINES {
            buf.pop_front();
        }
        buf.push_back(Entry { text: line.into(), kind });
    }
}

/// The newest `n` entries, oldest first.
pub fn recent(n: usize) -> Vec<Entry> {
    match ACTIVITY_LOG.lock() {
        Ok(buf) => {
            let skip = buf.len().saturating_sub(n);
            buf.iter().skip(skip).cloned().collect()
        }
        Err(_) => Vec::new(),
    }
}

pub fn clear() {
    if let Ok(mut buf) = ACTIVITY_LOG.lock() {
        buf.clear();
    }
}
