// kernel/src/config.rs
//
// Boot-time tunables.  Defaults are compiled in; the boot command line may
// override them with `key=value` pairs:
//
//   cache_pages=128 cache_buckets=64 pipe=block pipe_buf=4096
//   quantum=4 hz=100 stack_init=16 stack_max=2048 max_files=32

use core::fmt;

/// What a pipe does when a read finds it empty or a write finds it full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipePolicy {
    /// Return 0 immediately.
    ReturnZero,
    /// Park the caller until the other end makes progress.
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Maximum number of pages held by the page cache.
    pub cache_pages: usize,
    /// Hash buckets in the page cache.
    pub cache_buckets: usize,
    pub pipe_policy: PipePolicy,
    pub pipe_buffer: usize,
    /// Timer ticks a task may run before it is preempted.
    pub quantum_ticks: u32,
    pub timer_hz: u32,
    /// Pages in the stack VMA of a fresh address space.
    pub stack_initial_pages: usize,
    /// Hard limit (in pages) the stack may grow to below its top.
    pub stack_max_pages: usize,
    pub max_open_files: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cache_pages: 256,
            cache_buckets: 64,
            pipe_policy: PipePolicy::Block,
            pipe_buffer: 4096,
            quantum_ticks: 5,
            timer_hz: 100,
            stack_initial_pages: 16,
            stack_max_pages: 2048,
            max_open_files: 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    BadValue(&'static str),
    ZeroValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::BadValue(k) => write!(f, "malformed value for `{}`", k),
            ConfigError::ZeroValue(k) => write!(f, "`{}` must be non-zero", k),
        }
    }
}

fn parse_num(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    let n = value.parse::<usize>().map_err(|_| ConfigError::BadValue(key))?;
    if n == 0 {
        return Err(ConfigError::ZeroValue(key));
    }
    Ok(n)
}

impl KernelConfig {
    /// Defaults overridden by the `key=value` words of a command line.
    /// Words that are not ours (no `=`, unknown key) are logged and skipped.
    pub fn parse_cmdline(cmdline: &str) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        for word in cmdline.split_whitespace() {
            let Some((key, value)) = word.split_once('=') else {
                crate::serial_println!("config: ignoring `{}`", word);
                continue;
            };
            match key {
                "cache_pages" => cfg.cache_pages = parse_num("cache_pages", value)?,
                "cache_buckets" => cfg.cache_buckets = parse_num("cache_buckets", value)?,
                "pipe" => {
                    cfg.pipe_policy = match value {
                        "block" => PipePolicy::Block,
                        "zero" | "nonblock" => PipePolicy::ReturnZero,
                        _ => return Err(ConfigError::BadValue("pipe")),
                    }
                }
                "pipe_buf" => cfg.pipe_buffer = parse_num("pipe_buf", value)?,
                "quantum" => cfg.quantum_ticks = parse_num("quantum", value)? as u32,
                "hz" => cfg.timer_hz = parse_num("hz", value)? as u32,
                "stack_init" => cfg.stack_initial_pages = parse_num("stack_init", value)?,
                "stack_max" => cfg.stack_max_pages = parse_num("stack_max", value)?,
                "max_files" => cfg.max_open_files = parse_num("max_files", value)?,
                _ => crate::serial_println!("config: unknown key `{}`", key),
            }
        }
        if cfg.stack_initial_pages > cfg.stack_max_pages {
            return Err(ConfigError::BadValue("stack_init"));
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_and_ignores() {
        let cfg = KernelConfig::parse_cmdline("quiet cache_pages=8 pipe=zero color=red").unwrap();
        assert_eq!(cfg.cache_pages, 8);
        assert_eq!(cfg.pipe_policy, PipePolicy::ReturnZero);
        assert_eq!(cfg.quantum_ticks, KernelConfig::default().quantum_ticks);
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(
            KernelConfig::parse_cmdline("cache_pages=lots"),
            Err(ConfigError::BadValue("cache_pages"))
        );
        assert_eq!(
            KernelConfig::parse_cmdline("hz=0"),
            Err(ConfigError::ZeroValue("hz"))
        );
        assert!(KernelConfig::parse_cmdline("stack_init=64 stack_max=8").is_err());
    }
}
