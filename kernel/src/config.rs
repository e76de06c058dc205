//! Boot-time configuration from the bootloader command line.
//!
//! Two keys are recognized: `init=<path>` selects the main executable and
//! `loglevel=<error|warn|info|debug|trace>` sets the log filter. Unknown
//! tokens are ignored so the same command line can carry loader options.

use log::LevelFilter;

/// Parsed command-line configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootConfig<'a> {
    /// Path of the main executable inside the VFS, if given.
    pub init: Option<&'a str>,
    /// Log level filter; defaults to `Info`.
    pub loglevel: LevelFilter,
}

impl Default for BootConfig<'_> {
    fn default() -> Self {
        Self {
            init: None,
            loglevel: LevelFilter::Info,
        }
    }
}

fn parse_level(value: &str) -> Option<LevelFilter> {
    match value {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

/// Parse a whitespace-separated `key=value` command line.
pub fn parse_cmdline(cmdline: &str) -> BootConfig<'_> {
    let mut cfg = BootConfig::default();
    for token in cmdline.split_whitespace() {
        if let Some(path) = token.strip_prefix("init=") {
            if !path.is_empty() {
                cfg.init = Some(path);
            }
        } else if let Some(level) = token.strip_prefix("loglevel=") {
            if let Some(filter) = parse_level(level) {
                cfg.loglevel = filter;
            }
        }
    }
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_cmdline_defaults() {
        let cfg = parse_cmdline("");
        assert_eq!(cfg.init, None);
        assert_eq!(cfg.loglevel, LevelFilter::Info);
    }

    #[test]
    fn test_init_and_loglevel() {
        let cfg = parse_cmdline("console=ttyS0 init=bin/zsh loglevel=debug");
        assert_eq!(cfg.init, Some("bin/zsh"));
        assert_eq!(cfg.loglevel, LevelFilter::Debug);
    }

    #[test]
    fn test_bad_values_ignored() {
        let cfg = parse_cmdline("init= loglevel=chatty");
        assert_eq!(cfg.init, None);
        assert_eq!(cfg.loglevel, LevelFilter::Info);
    }
}
