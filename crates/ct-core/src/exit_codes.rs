//! Exit codes for the claude-top CLI.
//!
//! Exit codes communicate outcome without requiring output parsing and are
//! a stable contract for the editor integration:
//! - 0: clean run
//! - 1: invalid arguments or configuration
//! - 2: fatal setup failure (enumeration backend entirely unavailable)

/// Exit codes for claude-top operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Clean run.
    Clean = 0,

    /// Invalid arguments or configuration.
    ConfigError = 1,

    /// The process table cannot be read at all; the monitor refuses to
    /// start.
    SetupFailure = 2,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Terminate the process with this code.
    pub fn exit(self) -> ! {
        std::process::exit(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_stable() {
        assert_eq!(ExitCode::Clean.code(), 0);
        assert_eq!(ExitCode::ConfigError.code(), 1);
        assert_eq!(ExitCode::SetupFailure.code(), 2);
    }
}
