//! Environment helpers: centralized dotenv loading and ergonomic getters.
//! Every getter loads `.env` lazily, so calling `init_env()` first is optional.
use std::str::FromStr;
use std::sync::Once;

static INIT: Once = Once::new();

/// Load .env exactly once. Safe to call many times.
pub fn init_env() {
    INIT.call_once(|| {
        let _ = dotenv::dotenv();
    });
}

/// Get optional env var (None if unset or empty).
pub fn env_opt(key: &str) -> Option<String> {
    init_env();
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Get parsed value with default fallback.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    init_env();
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Boolean flag; accepts 1/true/on/yes (case-insensitive) as true.
pub fn env_flag(key: &str, default: bool) -> bool {
    init_env();
    match std::env::var(key) {
        Ok(raw) => {
            let v = raw.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "on" | "yes")
        }
        Err(_) => default,
    }
}

/// Database URL, first of `DATABASE_URL` then `DB_URL`.
pub fn db_url() -> anyhow::Result<String> {
    ["DATABASE_URL", "DB_URL"]
        .into_iter()
        .find_map(env_opt)
        .ok_or_else(|| anyhow::anyhow!("no database URL env vars set (DATABASE_URL or DB_URL)"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_values_fall_back_to_defaults() {
        assert_eq!(env_parse("SURVEILLANCE_INGEST_TEST_UNSET", 7usize), 7);
        assert!(env_flag("SURVEILLANCE_INGEST_TEST_UNSET", true));
        assert!(env_opt("SURVEILLANCE_INGEST_TEST_UNSET").is_none());
    }
}
