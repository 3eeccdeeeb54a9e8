use crate::cache::{Cache, CacheError};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::time::Duration;

/// Stats whose values are byte counts
const BYTE_STATS: &[&str] = &["bytes", "limit_maxbytes", "bytes_read", "bytes_written"];

/// Print the value stored under `key`
pub fn cmd_get(cache: &Cache, key: &str) -> Result<()> {
    let value = cache
        .get(key)?
        .ok_or_else(|| anyhow::anyhow!("Key not found: {}", key))?;

    let mut out = std::io::stdout().lock();
    out.write_all(&value)?;
    if !value.ends_with(b"\n") {
        out.write_all(b"\n")?;
    }
    Ok(())
}

/// Store a value, read from stdin when none is given
pub fn cmd_set(cache: &Cache, key: &str, value: Option<&str>, ttl: Option<u64>) -> Result<()> {
    let value = match value {
        Some(v) => v.as_bytes().to_vec(),
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read value from stdin")?;
            buf
        }
    };

    let stored = cache.set(key, &value, ttl.map(Duration::from_secs))?;
    if !stored {
        anyhow::bail!("Server declined to store {}", key);
    }

    println!("Stored {} ({})", key, format_bytes(value.len() as u64));
    Ok(())
}

pub fn cmd_delete(cache: &Cache, key: &str) -> Result<()> {
    if cache.delete(key)? {
        println!("Deleted: {}", key);
    } else {
        println!("Not found: {}", key);
    }
    Ok(())
}

pub fn cmd_incr(cache: &Cache, key: &str, delta: u64) -> Result<()> {
    let value = counter(cache.incr(key, delta))?;
    println!("{}", value);
    Ok(())
}

pub fn cmd_decr(cache: &Cache, key: &str, delta: u64) -> Result<()> {
    let value = counter(cache.decr(key, delta))?;
    println!("{}", value);
    Ok(())
}

pub fn cmd_touch(cache: &Cache, key: &str, ttl: u64) -> Result<()> {
    if !cache.touch(key, Some(Duration::from_secs(ttl)))? {
        anyhow::bail!("Key not found: {}", key);
    }
    println!("Touched {} (expires in {}s)", key, ttl);
    Ok(())
}

/// Print server statistics, sorted by name
pub fn cmd_stats(cache: &Cache) -> Result<()> {
    let stats: BTreeMap<String, String> = cache.stats()?.into_iter().collect();

    for (name, value) in &stats {
        println!("{}", format_stat(name, value));
    }

    let pool = cache.pool().stats();
    println!();
    println!(
        "Pool: {} created, {} reused, {} idle, {} failed",
        pool.total_created, pool.total_reused, pool.idle_connections, pool.failed_attempts
    );
    Ok(())
}

pub fn cmd_flush(cache: &Cache, force: bool) -> Result<()> {
    if !force {
        anyhow::bail!("Refusing to flush without --force");
    }
    cache.clear()?;
    println!("All items invalidated");
    Ok(())
}

pub fn cmd_version(cache: &Cache) -> Result<()> {
    println!("{}", cache.version()?);
    Ok(())
}

fn counter(result: Result<u64, CacheError>) -> Result<u64> {
    match result {
        Err(CacheError::NotFound(key)) => anyhow::bail!("Key not found: {}", key),
        other => Ok(other?),
    }
}

/// One `name value` line, with byte counts also shown human-readable
fn format_stat(name: &str, value: &str) -> String {
    match value.parse::<u64>() {
        Ok(bytes) if BYTE_STATS.contains(&name) => {
            format!("{:<24} {} ({})", name, value, format_bytes(bytes))
        }
        _ => format!("{:<24} {}", name, value),
    }
}

/// Format bytes in human-readable form (B, KB, MB, GB, etc.)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f64 = bytes as f64;
    let exponent = (bytes_f64.ln() / 1024_f64.ln()).floor() as usize;
    let exponent = exponent.min(UNITS.len() - 1);

    let value = bytes_f64 / 1024_f64.powi(exponent as i32);

    if exponent == 0 {
        format!("{} {}", bytes, UNITS[exponent])
    } else {
        format!("{:.2} {}", value, UNITS[exponent])
    }
}
