use std::time::Duration;

#[macro_export]
macro_rules! get_or_return {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            _ => return,
        }
    };
}

pub fn get_duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Parses a humantime duration (`10s`, `5m`); `0` is accepted as "no duration".
pub fn parse_human_duration(text: &str) -> anyhow::Result<Duration> {
    let text = text.trim();
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(text)
        .map_err(|e| anyhow::anyhow!("Invalid duration `{text}`: {e}. Use e.g. `30s` or `2h`"))
}

pub fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}
