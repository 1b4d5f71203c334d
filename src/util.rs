use std::env;
use std::path::Path;

use tracing::warn;

// ── Environment helpers ──────────────────────────────────────────────────

pub(crate) fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

pub(crate) fn env_string(name: &str, default: &str) -> String {
    env_optional(name).unwrap_or_else(|| default.to_string())
}

/// Parse a numeric variable, falling back to `default` when it is unset or
/// malformed. A malformed value is logged, never fatal.
pub(crate) fn env_parse<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match env_optional(name) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(var = name, value = %raw, %default, "invalid value, using default");
                default
            }
        },
        None => default,
    }
}

pub(crate) fn env_u64(name: &str, default: u64) -> u64 {
    env_parse(name, default)
}

pub(crate) fn env_usize(name: &str, default: usize) -> usize {
    env_parse(name, default)
}

pub(crate) fn env_f32(name: &str, default: f32) -> f32 {
    env_parse(name, default)
}

// ── Text helpers ─────────────────────────────────────────────────────────

/// First `max` characters of `text`, never splitting a code point.
pub(crate) fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Split a reply into transport-sized segments of at most `limit` characters.
///
/// Each cut lands on the last newline inside the window when there is one,
/// otherwise it is a hard cut at `limit`. Newlines at the start of the
/// remainder are dropped.
pub(crate) fn split_reply(text: &str, limit: usize) -> Vec<String> {
    let mut segments = Vec::new();
    if limit == 0 {
        return segments;
    }
    let mut rest = text;
    loop {
        let window_end = match rest.char_indices().nth(limit) {
            Some((idx, _)) => idx,
            None => break,
        };
        let cut = match rest[..window_end].rfind('\n') {
            Some(idx) if idx > 0 => idx,
            _ => window_end,
        };
        segments.push(rest[..cut].to_string());
        rest = rest[cut..].trim_start_matches('\n');
    }
    if !rest.is_empty() {
        segments.push(rest.to_string());
    }
    segments
}

// ── Persistence ──────────────────────────────────────────────────────────

/// Write `value` as pretty JSON next to `path` and rename it into place, so
/// readers never observe a half-written file.
pub(crate) async fn save_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(value).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

// ── Process groups ───────────────────────────────────────────────────────

/// Send SIGTERM to the process group led by `pid`.
#[cfg(unix)]
pub(crate) fn terminate_group(pid: u32) {
    unsafe {
        libc::kill(-(pid as i32), libc::SIGTERM);
    }
}

#[cfg(not(unix))]
pub(crate) fn terminate_group(_pid: u32) {}

/// SIGKILL the whole process group led by `pid`.
#[cfg(unix)]
pub(crate) fn kill_group(pid: u32) {
    unsafe {
        libc::killpg(pid as i32, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub(crate) fn kill_group(_pid: u32) {}

// ── Model lookup ─────────────────────────────────────────────────────────

pub(crate) const FALLBACK_MODEL: &str = "sonnet";

/// The model the assistant uses when a thread has no override: an explicit
/// `--model` among the extra args, then `model` from the assistant's
/// settings file, then [`FALLBACK_MODEL`].
pub(crate) fn default_model(extra_args: &[String], settings_path: Option<&Path>) -> String {
    let mut iter = extra_args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--model" {
            if let Some(value) = iter.next() {
                return value.clone();
            }
        } else if let Some(value) = arg.strip_prefix("--model=") {
            return value.to_string();
        }
    }

    if let Some(path) = settings_path {
        if let Ok(raw) = std::fs::read_to_string(path) {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(&raw) {
                if let Some(model) = json.get("model").and_then(|v| v.as_str()) {
                    if !model.trim().is_empty() {
                        return model.to_string();
                    }
                }
            }
        }
    }

    FALLBACK_MODEL.to_string()
}

// ── Tests ────────────────────────────────────────────────────────────────
